//! In-memory [`Collection`] fake shared by the matcher/reconcile/bulk tests.
//!
//! Behaves like the admin backend's REST routes: ids are assigned on create,
//! search is a loose case-insensitive substring match over string fields, and
//! failures can be injected per call family to exercise the degrade paths.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::{ApiError, Collection};

#[derive(Clone)]
pub(crate) struct MemoryCollection {
    label: &'static str,
    id_field: &'static str,
    rows: Arc<Mutex<Vec<Value>>>,
    next_id: Arc<AtomicI64>,
    fail_list: Arc<AtomicBool>,
    fail_search: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    fail_write_emails: Arc<Mutex<HashSet<String>>>,
}

impl MemoryCollection {
    pub fn users() -> Self {
        Self::new("users", "IdUsuario")
    }

    pub fn customers() -> Self {
        Self::new("customers", "IdCliente")
    }

    fn new(label: &'static str, id_field: &'static str) -> Self {
        Self {
            label,
            id_field,
            rows: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicI64::new(1000)),
            fail_list: Arc::new(AtomicBool::new(false)),
            fail_search: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_write_emails: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn seed(&self, row: Value) {
        self.rows.lock().expect("rows lock").push(row);
    }

    pub fn rows(&self) -> Vec<Value> {
        self.rows.lock().expect("rows lock").clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("rows lock").len()
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail create/update/patch for payloads carrying this email.
    pub fn fail_writes_for_email(&self, email: &str) {
        self.fail_write_emails
            .lock()
            .expect("email set lock")
            .insert(email.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.fail_writes.store(false, Ordering::SeqCst);
        self.fail_write_emails.lock().expect("email set lock").clear();
    }

    fn injected() -> ApiError {
        ApiError::Network("injected failure".to_string())
    }

    fn row_id(&self, row: &Value) -> Option<i64> {
        let field = row.get(self.id_field)?;
        field
            .as_i64()
            .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
    }

    fn write_blocked(&self, payload: &Value) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return true;
        }
        let email = payload
            .get("Correo")
            .or_else(|| payload.get("correo"))
            .and_then(Value::as_str)
            .unwrap_or("");
        self.fail_write_emails
            .lock()
            .expect("email set lock")
            .contains(email)
    }

    fn merge_into(target: &mut Value, payload: &Value) {
        if let (Value::Object(dst), Value::Object(src)) = (target, payload) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

impl Collection for MemoryCollection {
    fn label(&self) -> &str {
        self.label
    }

    async fn list(&self) -> Result<Vec<Value>, ApiError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(self.rows())
    }

    async fn get_by_id(&self, id: i64) -> Result<Value, ApiError> {
        self.rows()
            .into_iter()
            .find(|r| self.row_id(r) == Some(id))
            .ok_or(ApiError::Status {
                code: 404,
                detail: format!("{} {id} not found", self.label),
            })
    }

    async fn search(&self, term: &str) -> Result<Vec<Value>, ApiError> {
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        let needle = term.to_lowercase();
        Ok(self
            .rows()
            .into_iter()
            .filter(|row| {
                row.as_object().is_some_and(|obj| {
                    obj.values().any(|v| {
                        v.as_str()
                            .is_some_and(|s| s.to_lowercase().contains(&needle))
                    })
                })
            })
            .collect())
    }

    async fn create(&self, payload: &Value) -> Result<Value, ApiError> {
        if self.write_blocked(payload) {
            return Err(Self::injected());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = payload.clone();
        if let Value::Object(ref mut obj) = row {
            obj.insert(self.id_field.to_string(), Value::from(id));
        }
        self.rows.lock().expect("rows lock").push(row.clone());
        Ok(row)
    }

    async fn update(&self, id: i64, payload: &Value) -> Result<Value, ApiError> {
        if self.write_blocked(payload) {
            return Err(Self::injected());
        }
        let mut rows = self.rows.lock().expect("rows lock");
        // Split borrow: find the index first, then mutate.
        let idx = rows
            .iter()
            .position(|r| self.row_id(r) == Some(id))
            .ok_or(ApiError::Status {
                code: 404,
                detail: format!("{} {id} not found", self.label),
            })?;
        Self::merge_into(&mut rows[idx], payload);
        Ok(rows[idx].clone())
    }

    async fn patch(&self, id: i64, payload: &Value) -> Result<Value, ApiError> {
        self.update(id, payload).await
    }

    async fn delete(&self, id: i64) -> Result<(), ApiError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        let mut rows = self.rows.lock().expect("rows lock");
        let before = rows.len();
        rows.retain(|r| self.row_id(r) != Some(id));
        if rows.len() == before {
            return Err(ApiError::Status {
                code: 404,
                detail: format!("{} {id} not found", self.label),
            });
        }
        Ok(())
    }
}
