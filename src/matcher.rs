//! Counterpart lookup across the two collections.
//!
//! Given one side's record, find the record in the opposite collection that
//! represents the same person. Strategies run in strict order, first hit
//! wins: foreign-key scan, then email search, then document search. The
//! foreign-key step scans the full target collection because the backend
//! offers no equality filter on that field.
//!
//! Lookups are read-only and never fail the caller: a transport error in one
//! step is logged and treated as "no match at that step" so the next
//! strategy can still run.

use tracing::{debug, warn};

use crate::api::Collection;
use crate::records::{CustomerRecord, UserRecord};

/// Find the customer profile belonging to a user account.
pub async fn find_customer_for_user<C: Collection>(
    user: &UserRecord,
    customers: &C,
) -> Option<CustomerRecord> {
    // 1. Foreign-key scan: customer rows carry IdUsuario.
    if let Some(user_id) = user.id {
        match customers.list().await {
            Ok(rows) => {
                for raw in &rows {
                    let candidate = CustomerRecord::from_remote(raw);
                    if candidate.user_id == Some(user_id) {
                        debug!(user_id, customer_id = ?candidate.id, "counterpart found by foreign key");
                        return Some(candidate);
                    }
                }
            }
            Err(e) => {
                warn!(user_id, error = %e, "customer fk scan failed, falling through to email");
            }
        }
    }

    // 2. Email search, exact-filtered.
    if !user.email.is_empty() {
        if let Some(hit) = search_customers_exact(customers, &user.email, |c| c.email == user.email).await
        {
            debug!(email = %user.email, customer_id = ?hit.id, "counterpart found by email");
            return Some(hit);
        }
    }

    // 3. Document search, exact-filtered.
    if !user.document_id.is_empty() {
        if let Some(hit) = search_customers_exact(customers, &user.document_id, |c| {
            c.document_id == user.document_id
        })
        .await
        {
            debug!(document = %user.document_id, customer_id = ?hit.id, "counterpart found by document");
            return Some(hit);
        }
    }

    None
}

/// Find the user account owning a customer profile.
pub async fn find_user_for_customer<C: Collection>(
    customer: &CustomerRecord,
    users: &C,
) -> Option<UserRecord> {
    // 1. Foreign-key scan: the customer itself carries the user id.
    if let Some(fk) = customer.user_id {
        match users.list().await {
            Ok(rows) => {
                for raw in &rows {
                    let candidate = UserRecord::from_remote(raw);
                    if candidate.id == Some(fk) {
                        debug!(customer_id = ?customer.id, user_id = fk, "counterpart found by foreign key");
                        return Some(candidate);
                    }
                }
            }
            Err(e) => {
                warn!(fk, error = %e, "user fk scan failed, falling through to email");
            }
        }
    }

    // 2. Email search, exact-filtered.
    if !customer.email.is_empty() {
        if let Some(hit) =
            search_users_exact(users, &customer.email, |u| u.email == customer.email).await
        {
            debug!(email = %customer.email, user_id = ?hit.id, "counterpart found by email");
            return Some(hit);
        }
    }

    // 3. Document search, exact-filtered.
    if !customer.document_id.is_empty() {
        if let Some(hit) = search_users_exact(users, &customer.document_id, |u| {
            u.document_id == customer.document_id
        })
        .await
        {
            debug!(document = %customer.document_id, user_id = ?hit.id, "counterpart found by document");
            return Some(hit);
        }
    }

    None
}

async fn search_customers_exact<C, F>(customers: &C, term: &str, is_match: F) -> Option<CustomerRecord>
where
    C: Collection,
    F: Fn(&CustomerRecord) -> bool,
{
    match customers.search(term).await {
        Ok(rows) => rows
            .iter()
            .map(CustomerRecord::from_remote)
            .find(is_match),
        Err(e) => {
            warn!(term, error = %e, "customer search failed, treating as no match");
            None
        }
    }
}

async fn search_users_exact<C, F>(users: &C, term: &str, is_match: F) -> Option<UserRecord>
where
    C: Collection,
    F: Fn(&UserRecord) -> bool,
{
    match users.search(term).await {
        Ok(rows) => rows.iter().map(UserRecord::from_remote).find(is_match),
        Err(e) => {
            warn!(term, error = %e, "user search failed, treating as no match");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
