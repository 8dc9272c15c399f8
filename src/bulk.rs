//! Bulk synchronization driver.
//!
//! Walks one or both collections and funnels every row through the same
//! reconcile path the event-driven flow uses, counting successes and
//! failures per direction. Rows are processed sequentially; the backend is
//! small and ordering keeps the log readable when a run goes wrong.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::Collection;
use crate::matcher;
use crate::reconcile::SyncEngine;
use crate::records::{CustomerRecord, EntityKind, SyncOperation, UserRecord};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Which side(s) a bulk run pushes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    UsersToCustomers,
    CustomersToUsers,
    Both,
}

/// Per-direction counters for one bulk run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success: usize,
    pub failure: usize,
}

/// Counters for a whole bulk run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub users_to_customers: SyncReport,
    pub customers_to_users: SyncReport,
}

impl BulkReport {
    pub fn total(&self) -> SyncReport {
        SyncReport {
            success: self.users_to_customers.success + self.customers_to_users.success,
            failure: self.users_to_customers.failure + self.customers_to_users.failure,
        }
    }
}

/// Result of a point linkage check on one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkageReport {
    /// Counterpart exists and the foreign key points back at the source.
    pub linked: bool,
    pub source: Option<Value>,
    pub counterpart: Option<Value>,
    /// Canonical field names whose normalized values disagree.
    pub mismatched_fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl<C: Collection> SyncEngine<C> {
    /// Reconcile every row of the chosen side(s). One failed row never stops
    /// the run; it is counted and the walk continues.
    pub async fn sync_all(&self, direction: SyncDirection) -> BulkReport {
        info!(direction = ?direction, "bulk sync started");
        let mut report = BulkReport::default();

        if matches!(
            direction,
            SyncDirection::UsersToCustomers | SyncDirection::Both
        ) {
            report.users_to_customers = self.sync_users_to_customers().await;
        }
        if matches!(
            direction,
            SyncDirection::CustomersToUsers | SyncDirection::Both
        ) {
            report.customers_to_users = self.sync_customers_to_users().await;
        }

        let total = report.total();
        info!(
            success = total.success,
            failure = total.failure,
            "bulk sync finished"
        );
        report
    }

    async fn sync_users_to_customers(&self) -> SyncReport {
        let rows = match self.users.list().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "bulk sync cannot list users");
                return SyncReport::default();
            }
        };

        let mut report = SyncReport::default();
        for row in &rows {
            let user = UserRecord::from_remote(row);
            if !user.is_customer_capable() {
                debug!(user_id = ?user.id, role_id = user.role_id, "skipping non-customer role");
                continue;
            }
            if self
                .reconcile(EntityKind::User, row, SyncOperation::Update)
                .await
            {
                report.success += 1;
            } else {
                report.failure += 1;
            }
        }
        report
    }

    async fn sync_customers_to_users(&self) -> SyncReport {
        let rows = match self.customers.list().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "bulk sync cannot list customers");
                return SyncReport::default();
            }
        };

        let mut report = SyncReport::default();
        for row in &rows {
            if self
                .reconcile(EntityKind::Customer, row, SyncOperation::Update)
                .await
            {
                report.success += 1;
            } else {
                report.failure += 1;
            }
        }
        report
    }

    /// Point check: is this entity linked to a consistent counterpart?
    /// Read-only; nothing is repaired here.
    pub async fn verify_linkage(&self, kind: EntityKind, id: i64) -> LinkageReport {
        match kind {
            EntityKind::User => {
                let source = match self.users.get_by_id(id).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(id, error = %e, "linkage check cannot fetch user");
                        return LinkageReport {
                            linked: false,
                            source: None,
                            counterpart: None,
                            mismatched_fields: Vec::new(),
                        };
                    }
                };
                let user = UserRecord::from_remote(&source);
                match matcher::find_customer_for_user(&user, &self.customers).await {
                    Some(customer) => {
                        let linked = customer.user_id == Some(id);
                        let mismatched = compare_fields(&user, &customer);
                        LinkageReport {
                            linked,
                            source: Some(source),
                            counterpart: Some(customer.to_payload()),
                            mismatched_fields: mismatched,
                        }
                    }
                    None => LinkageReport {
                        linked: false,
                        source: Some(source),
                        counterpart: None,
                        mismatched_fields: Vec::new(),
                    },
                }
            }
            EntityKind::Customer => {
                let source = match self.customers.get_by_id(id).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(id, error = %e, "linkage check cannot fetch customer");
                        return LinkageReport {
                            linked: false,
                            source: None,
                            counterpart: None,
                            mismatched_fields: Vec::new(),
                        };
                    }
                };
                let customer = CustomerRecord::from_remote(&source);
                match matcher::find_user_for_customer(&customer, &self.users).await {
                    Some(user) => {
                        let linked = customer.user_id.is_some() && customer.user_id == user.id;
                        let mismatched = compare_fields(&user, &customer);
                        LinkageReport {
                            linked,
                            source: Some(source),
                            counterpart: Some(user.to_payload(None)),
                            mismatched_fields: mismatched,
                        }
                    }
                    None => LinkageReport {
                        linked: false,
                        source: Some(source),
                        counterpart: None,
                        mismatched_fields: Vec::new(),
                    },
                }
            }
        }
    }
}

/// Compare the fields both schemas share, on the normalized records.
fn compare_fields(user: &UserRecord, customer: &CustomerRecord) -> Vec<String> {
    let mut mismatched = Vec::new();
    if user.first_name != customer.first_name {
        mismatched.push("first_name".to_string());
    }
    if user.last_name != customer.last_name {
        mismatched.push("last_name".to_string());
    }
    if user.email != customer.email {
        mismatched.push("email".to_string());
    }
    if user.document_id != customer.document_id {
        mismatched.push("document_id".to_string());
    }
    if user.active != customer.active {
        mismatched.push("active".to_string());
    }
    mismatched
}

// ===========================================================================
// Tests
// ===========================================================================
