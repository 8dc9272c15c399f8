//! Bidirectional reconciliation engine.
//!
//! One call per mutation observed on either collection: the engine locates
//! the counterpart record, decides create/update/delete/patch, pushes the
//! change through the [`Collection`] boundary, and records the result in the
//! local mirror. All cross-collection writes for a given source entity are
//! serialized behind a per-entity lock so overlapping events cannot race
//! into duplicate counterparts.
//!
//! The customer-to-user direction is a two-write saga: the user account is
//! created first, then the customer row is updated with the new foreign key.
//! When the second write fails the engine records `pending_link` in the
//! mirror; [`SyncEngine::repair_pending_links`] re-issues those writes later.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, Collection, HttpCollection, RemoteConfig};
use crate::matcher;
use crate::mirror::{LinkState, MirrorEntry, MirrorStore};
use crate::notify::StatusNotifier;
use crate::records::{
    customer_status_patch, user_status_patch, CustomerRecord, EntityKind, SyncOperation,
    UserRecord,
};

// ---------------------------------------------------------------------------
// Internal result types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub(crate) enum SyncError {
    #[error("source record has no id")]
    MissingId,
    #[error("backend did not return an id for the created record")]
    MissingCreatedId,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What a reconcile pass did to the counterpart collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Created { counterpart_id: i64 },
    /// Counterpart created but the follow-up foreign-key write failed; the
    /// link is recorded as pending and repaired later.
    CreatedUnlinked { counterpart_id: i64 },
    Updated { counterpart_id: i64 },
    Deleted { counterpart_id: i64 },
    NoOp,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::CreatedUnlinked { .. } => "created_unlinked",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
            Self::NoOp => "noop",
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The reconciliation engine over two injected collections.
pub struct SyncEngine<C: Collection> {
    pub(crate) users: C,
    pub(crate) customers: C,
    pub(crate) mirror: MirrorStore,
    notifier: StatusNotifier,
    locks: StdMutex<HashMap<(EntityKind, i64), Arc<AsyncMutex<()>>>>,
}

impl<C: Collection> SyncEngine<C> {
    pub fn new(users: C, customers: C, mirror: MirrorStore) -> Self {
        Self {
            users,
            customers,
            mirror,
            notifier: StatusNotifier::new(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Status-event publisher; subscribe before calling [`reconcile`].
    ///
    /// [`reconcile`]: SyncEngine::reconcile
    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    pub fn mirror(&self) -> &MirrorStore {
        &self.mirror
    }

    /// Reconcile one observed mutation. Returns whether the counterpart
    /// collection is consistent with the source after the call; failures are
    /// logged, never raised, so callers can fire-and-forget.
    pub async fn reconcile(&self, kind: EntityKind, record: &Value, op: SyncOperation) -> bool {
        match kind {
            EntityKind::User => self.reconcile_user_event(record, op).await,
            EntityKind::Customer => self.reconcile_customer_event(record, op).await,
        }
    }

    /// Re-issue the foreign-key write for every `pending_link` mirror entry.
    /// Returns how many entries were repaired.
    pub async fn repair_pending_links(&self) -> usize {
        let pending = self.mirror.pending_links();
        if pending.is_empty() {
            return 0;
        }
        info!(count = pending.len(), "repairing pending links");

        let mut repaired = 0;
        for entry in pending {
            // Only the customer-to-user direction needs a second write.
            if entry.kind != EntityKind::Customer {
                continue;
            }
            let lock = self.lock_for(entry.kind, entry.id);
            let _guard = lock.lock().await;

            match self.customers.update(entry.id, &entry.record).await {
                Ok(_) => {
                    if let Err(e) = self.mirror.mark_linked(entry.kind, entry.id) {
                        warn!(id = entry.id, error = %e, "repaired link but mirror update failed");
                    }
                    info!(customer_id = entry.id, "pending link repaired");
                    repaired += 1;
                }
                Err(e) => {
                    warn!(customer_id = entry.id, error = %e, "pending link repair failed, will retry");
                }
            }
        }
        repaired
    }

    fn lock_for(&self, kind: EntityKind, id: i64) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Idle entries (no guard or waiter holds a clone) are evicted on the
        // next acquisition so bulk runs do not accrete one lock per row.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry((kind, id)).or_default().clone()
    }

    // -----------------------------------------------------------------------
    // User events: push into the Customers collection
    // -----------------------------------------------------------------------

    async fn reconcile_user_event(&self, record: &Value, op: SyncOperation) -> bool {
        let user = UserRecord::from_remote(record);
        let Some(user_id) = user.id else {
            warn!(op = %op, "user event without id, skipping");
            return false;
        };

        let lock = self.lock_for(EntityKind::User, user_id);
        let _guard = lock.lock().await;

        match self.apply_user_event(&user, op).await {
            Ok(outcome) => {
                info!(user_id, op = %op, outcome = outcome.label(), "user reconciled");
                self.record_source(
                    EntityKind::User,
                    user_id,
                    user.to_payload(None),
                    user.active,
                    &outcome,
                );
                true
            }
            Err(e) => {
                warn!(user_id, op = %op, error = %e, "user reconcile failed");
                false
            }
        }
    }

    async fn apply_user_event(
        &self,
        user: &UserRecord,
        op: SyncOperation,
    ) -> Result<Outcome, SyncError> {
        match op {
            SyncOperation::Create => {
                if !user.is_customer_capable() {
                    debug!(role_id = user.role_id, "user role is not customer-capable, nothing to do");
                    return Ok(Outcome::NoOp);
                }
                self.push_user_to_customer(user).await
            }
            SyncOperation::Update => {
                if !user.is_customer_capable() {
                    // Role downgrade: the account no longer shops, retire the
                    // commerce profile if one exists.
                    return match matcher::find_customer_for_user(user, &self.customers).await {
                        Some(existing) => {
                            let cid = existing.id.ok_or(SyncError::MissingId)?;
                            self.delete_customer(cid).await?;
                            Ok(Outcome::Deleted {
                                counterpart_id: cid,
                            })
                        }
                        None => Ok(Outcome::NoOp),
                    };
                }
                self.push_user_to_customer(user).await
            }
            SyncOperation::Delete => {
                match matcher::find_customer_for_user(user, &self.customers).await {
                    Some(existing) => {
                        let cid = existing.id.ok_or(SyncError::MissingId)?;
                        self.delete_customer(cid).await?;
                        Ok(Outcome::Deleted {
                            counterpart_id: cid,
                        })
                    }
                    None => Ok(Outcome::NoOp),
                }
            }
            SyncOperation::ChangeStatus => {
                match matcher::find_customer_for_user(user, &self.customers).await {
                    Some(existing) => {
                        let cid = existing.id.ok_or(SyncError::MissingId)?;
                        self.customers
                            .patch(cid, &customer_status_patch(user.active))
                            .await?;
                        self.record_counterpart_customer(cid, user);
                        Ok(Outcome::Updated {
                            counterpart_id: cid,
                        })
                    }
                    // Status toggle on a user with no profile yet: a missing
                    // counterpart is materialized rather than silently
                    // skipped, but only for customer-capable roles.
                    None => {
                        if !user.is_customer_capable() {
                            debug!(
                                role_id = user.role_id,
                                "no profile to toggle for non-customer role"
                            );
                            return Ok(Outcome::NoOp);
                        }
                        self.push_user_to_customer(user).await
                    }
                }
            }
        }
    }

    /// Upsert the customer profile mirroring `user`. The foreign key rides in
    /// the payload, so this direction links in a single write.
    async fn push_user_to_customer(&self, user: &UserRecord) -> Result<Outcome, SyncError> {
        let desired = CustomerRecord::from_user(user);
        let payload = desired.to_payload();

        match matcher::find_customer_for_user(user, &self.customers).await {
            Some(existing) => {
                let cid = existing.id.ok_or(SyncError::MissingId)?;
                self.customers.update(cid, &payload).await?;
                self.record_counterpart_customer(cid, user);
                Ok(Outcome::Updated {
                    counterpart_id: cid,
                })
            }
            None => {
                let created = self.customers.create(&payload).await?;
                let cid = CustomerRecord::from_remote(&created)
                    .id
                    .ok_or(SyncError::MissingCreatedId)?;
                self.record_counterpart_customer(cid, user);
                Ok(Outcome::Created {
                    counterpart_id: cid,
                })
            }
        }
    }

    async fn delete_customer(&self, cid: i64) -> Result<(), SyncError> {
        self.customers.delete(cid).await?;
        self.mirror_write(MirrorEntry::new(
            EntityKind::Customer,
            cid,
            Value::Null,
            false,
            LinkState::Unlinked,
        ));
        self.notifier.emit(EntityKind::Customer, cid, false);
        Ok(())
    }

    fn record_counterpart_customer(&self, cid: i64, user: &UserRecord) {
        let mut snapshot = CustomerRecord::from_user(user);
        snapshot.id = Some(cid);
        self.mirror_write(MirrorEntry::new(
            EntityKind::Customer,
            cid,
            snapshot.to_payload(),
            user.active,
            LinkState::Linked,
        ));
        self.notifier.emit(EntityKind::Customer, cid, user.active);
    }

    // -----------------------------------------------------------------------
    // Customer events: push into the Users collection
    // -----------------------------------------------------------------------

    async fn reconcile_customer_event(&self, record: &Value, op: SyncOperation) -> bool {
        let customer = CustomerRecord::from_remote(record);
        let Some(customer_id) = customer.id else {
            warn!(op = %op, "customer event without id, skipping");
            return false;
        };

        let lock = self.lock_for(EntityKind::Customer, customer_id);
        let _guard = lock.lock().await;

        match self.apply_customer_event(&customer, op).await {
            Ok(outcome) => {
                info!(customer_id, op = %op, outcome = outcome.label(), "customer reconciled");
                self.record_customer_source(&customer, customer_id, &outcome);
                true
            }
            Err(e) => {
                warn!(customer_id, op = %op, error = %e, "customer reconcile failed");
                false
            }
        }
    }

    async fn apply_customer_event(
        &self,
        customer: &CustomerRecord,
        op: SyncOperation,
    ) -> Result<Outcome, SyncError> {
        match op {
            SyncOperation::Create | SyncOperation::Update => {
                match matcher::find_user_for_customer(customer, &self.users).await {
                    Some(existing) => {
                        let uid = existing.id.ok_or(SyncError::MissingId)?;
                        // Updates never carry credentials.
                        let payload = UserRecord::from_customer(customer).to_payload(None);
                        self.users.update(uid, &payload).await?;
                        self.record_counterpart_user(uid, customer);
                        Ok(Outcome::Updated {
                            counterpart_id: uid,
                        })
                    }
                    None => self.create_user_and_link(customer).await,
                }
            }
            SyncOperation::Delete => {
                match matcher::find_user_for_customer(customer, &self.users).await {
                    Some(existing) => {
                        let uid = existing.id.ok_or(SyncError::MissingId)?;
                        self.users.delete(uid).await?;
                        self.mirror_write(MirrorEntry::new(
                            EntityKind::User,
                            uid,
                            Value::Null,
                            false,
                            LinkState::Unlinked,
                        ));
                        self.notifier.emit(EntityKind::User, uid, false);
                        Ok(Outcome::Deleted {
                            counterpart_id: uid,
                        })
                    }
                    None => Ok(Outcome::NoOp),
                }
            }
            SyncOperation::ChangeStatus => {
                match matcher::find_user_for_customer(customer, &self.users).await {
                    Some(existing) => {
                        let uid = existing.id.ok_or(SyncError::MissingId)?;
                        self.users
                            .patch(uid, &user_status_patch(customer.active))
                            .await?;
                        self.record_counterpart_user(uid, customer);
                        Ok(Outcome::Updated {
                            counterpart_id: uid,
                        })
                    }
                    None => self.create_user_and_link(customer).await,
                }
            }
        }
    }

    /// The create-then-link saga. A fresh account gets a random throwaway
    /// credential; the user resets it through the normal recovery flow.
    async fn create_user_and_link(&self, customer: &CustomerRecord) -> Result<Outcome, SyncError> {
        let customer_id = customer.id.ok_or(SyncError::MissingId)?;
        let temp_password = Uuid::new_v4().to_string();
        let payload = UserRecord::from_customer(customer).to_payload(Some(&temp_password));

        let created = self.users.create(&payload).await?;
        let uid = UserRecord::from_remote(&created)
            .id
            .ok_or(SyncError::MissingCreatedId)?;
        self.record_counterpart_user(uid, customer);

        // Second write: persist the foreign key back on the customer row.
        let mut linked = customer.clone();
        linked.user_id = Some(uid);
        match self.customers.update(customer_id, &linked.to_payload()).await {
            Ok(_) => Ok(Outcome::Created {
                counterpart_id: uid,
            }),
            Err(e) => {
                warn!(
                    customer_id,
                    user_id = uid,
                    error = %e,
                    "user created but link write failed, recording pending link"
                );
                Ok(Outcome::CreatedUnlinked {
                    counterpart_id: uid,
                })
            }
        }
    }

    fn record_counterpart_user(&self, uid: i64, customer: &CustomerRecord) {
        let mut snapshot = UserRecord::from_customer(customer);
        snapshot.id = Some(uid);
        self.mirror_write(MirrorEntry::new(
            EntityKind::User,
            uid,
            snapshot.to_payload(None),
            customer.active,
            LinkState::Linked,
        ));
        self.notifier.emit(EntityKind::User, uid, customer.active);
    }

    // -----------------------------------------------------------------------
    // Mirror bookkeeping
    // -----------------------------------------------------------------------

    /// Record the source side of a successful reconcile. Failed reconciles
    /// leave the previous snapshot untouched.
    fn record_source(
        &self,
        kind: EntityKind,
        id: i64,
        payload: Value,
        active: bool,
        outcome: &Outcome,
    ) {
        let link_state = match outcome {
            Outcome::Created { .. } | Outcome::Updated { .. } => LinkState::Linked,
            Outcome::CreatedUnlinked { .. } => LinkState::PendingLink,
            Outcome::Deleted { .. } | Outcome::NoOp => LinkState::Unlinked,
        };
        self.mirror_write(MirrorEntry::new(kind, id, payload, active, link_state));
    }

    /// Customer-side source entry. The snapshot carries the counterpart's id
    /// as the foreign key so a pending-link entry is replayable as-is.
    fn record_customer_source(&self, customer: &CustomerRecord, id: i64, outcome: &Outcome) {
        let mut snapshot = customer.clone();
        match outcome {
            Outcome::Created { counterpart_id }
            | Outcome::CreatedUnlinked { counterpart_id }
            | Outcome::Updated { counterpart_id } => {
                snapshot.user_id = Some(*counterpart_id);
            }
            Outcome::Deleted { .. } | Outcome::NoOp => {}
        }
        self.record_source(
            EntityKind::Customer,
            id,
            snapshot.to_payload(),
            customer.active,
            outcome,
        );
    }

    fn mirror_write(&self, entry: MirrorEntry) {
        if let Err(e) = self.mirror.write(&entry) {
            warn!(kind = %entry.kind, id = entry.id, error = %e, "mirror write failed");
        }
    }
}

impl SyncEngine<HttpCollection> {
    /// Engine wired to the admin backend's REST routes, with the mirror
    /// database under `data_dir`.
    pub fn over_http(config: &RemoteConfig, data_dir: &Path) -> Result<Self, String> {
        let users = HttpCollection::new(config, "usuarios").map_err(|e| e.to_string())?;
        let customers = HttpCollection::new(config, "clientes").map_err(|e| e.to_string())?;
        let mirror = MirrorStore::open(data_dir)?;
        Ok(Self::new(users, customers, mirror))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StatusEvent;
    use crate::testutil::MemoryCollection;
    use serde_json::json;

    fn engine() -> (
        SyncEngine<MemoryCollection>,
        MemoryCollection,
        MemoryCollection,
    ) {
        let users = MemoryCollection::users();
        let customers = MemoryCollection::customers();
        let engine = SyncEngine::new(
            users.clone(),
            customers.clone(),
            MirrorStore::open_in_memory().expect("in-memory mirror"),
        );
        (engine, users, customers)
    }

    fn ana() -> Value {
        json!({
            "IdUsuario": 77, "Documento": "12-345", "Nombre": "ana",
            "Apellido": "lopez", "Correo": "ANA@X.COM", "Telefono": "555",
            "Direccion": "Calle 1", "Estado": true, "IdRol": 2
        })
    }

    #[tokio::test]
    async fn test_user_create_materializes_customer_profile() {
        let (engine, _users, customers) = engine();
        let mut rx = engine.notifier().subscribe();

        let ok = engine
            .reconcile(EntityKind::User, &ana(), SyncOperation::Create)
            .await;
        assert!(ok);

        let rows = customers.rows();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["Documento"], "12345");
        assert_eq!(row["Nombre"], "Ana");
        assert_eq!(row["Apellido"], "Lopez");
        assert_eq!(row["Correo"], "ana@x.com");
        assert_eq!(row["Estado"], 1);
        assert_eq!(row["IdUsuario"], 77);

        let cid = row["IdCliente"].as_i64().expect("assigned id");
        let entry = engine
            .mirror()
            .read(EntityKind::Customer, cid)
            .expect("counterpart mirrored");
        assert_eq!(entry.link_state, LinkState::Linked);
        assert!(entry.active);

        let event = rx.recv().await.expect("status event");
        assert_eq!(
            event,
            StatusEvent {
                kind: EntityKind::Customer,
                id: cid,
                active: true
            }
        );
    }

    #[tokio::test]
    async fn test_repeated_user_update_does_not_duplicate_customer() {
        let (engine, _users, customers) = engine();
        for _ in 0..3 {
            assert!(
                engine
                    .reconcile(EntityKind::User, &ana(), SyncOperation::Update)
                    .await
            );
        }
        assert_eq!(customers.len(), 1, "updates must converge on one profile");
    }

    #[tokio::test]
    async fn test_email_match_backfills_foreign_key() {
        let (engine, _users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Correo": "b@x.com", "IdUsuario": null, "Estado": 1
        }));

        let user = json!({ "IdUsuario": 9, "Correo": "B@X.COM", "Estado": true, "IdRol": 2 });
        assert!(
            engine
                .reconcile(EntityKind::User, &user, SyncOperation::Update)
                .await
        );

        let rows = customers.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["IdUsuario"], 9, "existing profile gains the fk");
    }

    #[tokio::test]
    async fn test_user_delete_removes_counterpart_then_noops() {
        let (engine, _users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Correo": "ana@x.com", "IdUsuario": 77, "Estado": 1
        }));

        assert!(
            engine
                .reconcile(EntityKind::User, &ana(), SyncOperation::Delete)
                .await
        );
        assert_eq!(customers.len(), 0);

        // Second delete has nothing to do and still reports consistency.
        assert!(
            engine
                .reconcile(EntityKind::User, &ana(), SyncOperation::Delete)
                .await
        );
    }

    #[tokio::test]
    async fn test_role_downgrade_retires_customer_profile() {
        let (engine, _users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Correo": "ana@x.com", "IdUsuario": 77, "Estado": 1
        }));

        let downgraded = json!({
            "IdUsuario": 77, "Correo": "ana@x.com", "Estado": true, "IdRol": 1
        });
        assert!(
            engine
                .reconcile(EntityKind::User, &downgraded, SyncOperation::Update)
                .await
        );
        assert_eq!(customers.len(), 0, "downgrade deletes the profile");
    }

    #[tokio::test]
    async fn test_user_create_with_non_customer_role_is_noop() {
        let (engine, _users, customers) = engine();
        let admin = json!({ "IdUsuario": 1, "Correo": "root@x.com", "IdRol": 1 });
        assert!(
            engine
                .reconcile(EntityKind::User, &admin, SyncOperation::Create)
                .await
        );
        assert_eq!(customers.len(), 0);
    }

    #[tokio::test]
    async fn test_change_status_with_non_customer_role_does_not_materialize() {
        let (engine, _users, customers) = engine();
        let admin = json!({
            "IdUsuario": 1, "Correo": "root@x.com", "Estado": false, "IdRol": 1
        });
        assert!(
            engine
                .reconcile(EntityKind::User, &admin, SyncOperation::ChangeStatus)
                .await
        );
        assert_eq!(
            customers.len(),
            0,
            "a status toggle must not create a profile for a non-customer role"
        );
    }

    #[tokio::test]
    async fn test_change_status_patches_existing_and_materializes_missing() {
        let (engine, _users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Correo": "ana@x.com", "IdUsuario": 77, "Estado": 1
        }));

        let deactivated = json!({
            "IdUsuario": 77, "Correo": "ana@x.com", "Estado": false, "IdRol": 2
        });
        assert!(
            engine
                .reconcile(EntityKind::User, &deactivated, SyncOperation::ChangeStatus)
                .await
        );
        assert_eq!(customers.rows()[0]["Estado"], 0, "numeric status patch");

        // No profile for user 10: the toggle materializes one.
        let other = json!({ "IdUsuario": 10, "Correo": "c@x.com", "Estado": true, "IdRol": 2 });
        assert!(
            engine
                .reconcile(EntityKind::User, &other, SyncOperation::ChangeStatus)
                .await
        );
        assert_eq!(customers.len(), 2);
    }

    #[tokio::test]
    async fn test_customer_create_creates_user_and_links_back() {
        let (engine, users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Nombre": "rex", "Correo": "b@x.com",
            "Estado": 1, "IdUsuario": null
        }));

        let event = json!({
            "IdCliente": 5, "Nombre": "rex", "Correo": "b@x.com",
            "Estado": 1, "IdUsuario": null
        });
        assert!(
            engine
                .reconcile(EntityKind::Customer, &event, SyncOperation::Create)
                .await
        );

        let user_rows = users.rows();
        assert_eq!(user_rows.len(), 1);
        let user = &user_rows[0];
        assert_eq!(user["IdRol"], 2);
        assert_eq!(user["Correo"], "b@x.com");
        let pw = user["Contrasena"].as_str().expect("temp credential");
        assert!(!pw.is_empty());

        let uid = user["IdUsuario"].as_i64().expect("assigned id");
        assert_eq!(
            customers.rows()[0]["IdUsuario"], uid,
            "fk persisted on the customer row"
        );
        assert_eq!(
            engine
                .mirror()
                .read(EntityKind::Customer, 5)
                .expect("mirrored")
                .link_state,
            LinkState::Linked
        );
    }

    #[tokio::test]
    async fn test_customer_update_never_sends_credentials() {
        let (engine, users, _customers) = engine();
        users.seed(json!({
            "IdUsuario": 9, "Correo": "b@x.com", "Estado": true, "IdRol": 2
        }));

        let event = json!({
            "IdCliente": 5, "Nombre": "rex", "Correo": "b@x.com",
            "Estado": 1, "IdUsuario": 9
        });
        assert!(
            engine
                .reconcile(EntityKind::Customer, &event, SyncOperation::Update)
                .await
        );

        let user = &users.rows()[0];
        assert_eq!(user["Nombre"], "Rex");
        assert!(
            user.get("Contrasena").is_none(),
            "updates must not touch the password"
        );
    }

    #[tokio::test]
    async fn test_customer_change_status_patches_user_as_boolean() {
        let (engine, users, _customers) = engine();
        users.seed(json!({
            "IdUsuario": 9, "Correo": "b@x.com", "Estado": true, "IdRol": 2
        }));

        let event = json!({
            "IdCliente": 5, "Correo": "b@x.com", "Estado": 0, "IdUsuario": 9
        });
        assert!(
            engine
                .reconcile(EntityKind::Customer, &event, SyncOperation::ChangeStatus)
                .await
        );
        assert_eq!(users.rows()[0]["Estado"], false, "boolean status patch");
    }

    #[tokio::test]
    async fn test_partial_link_failure_records_pending_and_repairs() {
        let (engine, users, customers) = engine();
        customers.seed(json!({
            "IdCliente": 5, "Nombre": "rex", "Correo": "b@x.com",
            "Estado": 1, "IdUsuario": null
        }));
        // The follow-up fk write carries the customer's email; block it.
        customers.fail_writes_for_email("b@x.com");

        let event = json!({
            "IdCliente": 5, "Nombre": "rex", "Correo": "b@x.com",
            "Estado": 1, "IdUsuario": null
        });
        assert!(
            engine
                .reconcile(EntityKind::Customer, &event, SyncOperation::Create)
                .await,
            "user creation succeeded, link is recoverable"
        );

        let uid = users.rows()[0]["IdUsuario"].as_i64().expect("user id");
        assert!(
            customers.rows()[0]["IdUsuario"].is_null(),
            "fk write was blocked"
        );

        let pending = engine.mirror().pending_links();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 5);
        assert_eq!(pending[0].record["IdUsuario"], uid, "replayable payload");

        customers.clear_write_failures();
        assert_eq!(engine.repair_pending_links().await, 1);
        assert_eq!(customers.rows()[0]["IdUsuario"], uid);
        assert!(engine.mirror().pending_links().is_empty());

        // Nothing left to repair.
        assert_eq!(engine.repair_pending_links().await, 0);
    }

    #[tokio::test]
    async fn test_event_without_id_fails_fast() {
        let (engine, _users, customers) = engine();
        assert!(
            !engine
                .reconcile(EntityKind::User, &json!({}), SyncOperation::Update)
                .await
        );
        assert!(
            !engine
                .reconcile(EntityKind::Customer, &json!({}), SyncOperation::Delete)
                .await
        );
        assert_eq!(customers.len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_events_for_same_user_do_not_duplicate() {
        let (engine, _users, customers) = engine();

        let record = ana();
        let a = engine.reconcile(EntityKind::User, &record, SyncOperation::Update);
        let b = engine.reconcile(EntityKind::User, &record, SyncOperation::Update);
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra && rb);
        assert_eq!(customers.len(), 1, "per-entity lock serializes the upsert");
    }

    #[tokio::test]
    async fn test_idle_lock_entries_are_evicted() {
        let (engine, _users, _customers) = engine();
        for n in 1..=5 {
            let record = json!({
                "IdUsuario": n, "Correo": format!("u{n}@x.com"),
                "Estado": true, "IdRol": 2
            });
            assert!(
                engine
                    .reconcile(EntityKind::User, &record, SyncOperation::Update)
                    .await
            );
        }

        // The next acquisition sweeps every lock nothing is holding.
        let live = engine.lock_for(EntityKind::User, 99);
        let map = engine.locks.lock().expect("lock map");
        assert_eq!(map.len(), 1, "only the held lock survives");
        assert!(map.contains_key(&(EntityKind::User, 99)));
        drop(map);
        drop(live);
    }

    #[tokio::test]
    async fn test_failed_reconcile_keeps_previous_mirror_snapshot() {
        let (engine, _users, customers) = engine();
        assert!(
            engine
                .reconcile(EntityKind::User, &ana(), SyncOperation::Update)
                .await
        );
        let before = engine
            .mirror()
            .read(EntityKind::User, 77)
            .expect("snapshot");

        customers.set_fail_list(true);
        customers.set_fail_search(true);
        customers.set_fail_writes(true);
        let changed = json!({
            "IdUsuario": 77, "Correo": "nueva@x.com", "Estado": true, "IdRol": 2
        });
        assert!(
            !engine
                .reconcile(EntityKind::User, &changed, SyncOperation::Update)
                .await
        );

        let after = engine
            .mirror()
            .read(EntityKind::User, 77)
            .expect("snapshot retained");
        assert_eq!(after.record, before.record);
    }
}
