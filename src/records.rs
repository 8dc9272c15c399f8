//! Canonical record shapes for the two remote collections.
//!
//! The backend's user and customer endpoints disagree on field casing
//! (`Nombre` on one route, `nombre` on another), so every remote payload is
//! converted here, at the boundary, into one canonical internal shape. The
//! adapters in this module are the only place that tolerates the casing
//! fallbacks; the rest of the crate works on typed records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::normalize;

/// Role id that marks a user account as customer-capable.
pub const CUSTOMER_ROLE_ID: i64 = 2;

// ---------------------------------------------------------------------------
// Entity kind and operation tags
// ---------------------------------------------------------------------------

/// Which of the two collections a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Customer,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Customer => "customer",
        }
    }

    /// The opposite collection.
    pub fn counterpart(&self) -> Self {
        match self {
            Self::User => Self::Customer,
            Self::Customer => Self::User,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" | "usuario" => Some(Self::User),
            "customer" | "cliente" => Some(Self::Customer),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation that triggered a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    ChangeStatus,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ChangeStatus => "change_status",
        }
    }

    /// Parse an operation token. Accepts both the English names and the
    /// legacy Spanish tokens still used by older call sites.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "create" | "crear" => Some(Self::Create),
            "update" | "actualizar" => Some(Self::Update),
            "delete" | "eliminar" => Some(Self::Delete),
            "change_status" | "changeStatus" | "cambiarEstado" | "cambiar_estado" => {
                Some(Self::ChangeStatus)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Duck-typed field access (inconsistent casing between endpoints)
// ---------------------------------------------------------------------------

fn value_any<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| v.get(k)).filter(|f| !f.is_null())
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    value_any(v, keys)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Integer field lookup tolerating stringified numbers ("77" vs 77).
fn i64_any(v: &Value, keys: &[&str]) -> Option<i64> {
    let field = value_any(v, keys)?;
    field
        .as_i64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
}

// ---------------------------------------------------------------------------
// User records
// ---------------------------------------------------------------------------

/// Canonical shape of an auth-capable account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Option<i64>,
    pub document_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub active: bool,
    pub role_id: i64,
}

impl UserRecord {
    /// Adapt a remote user payload into the canonical shape. Fields are
    /// normalized here so the rest of the crate never re-normalizes.
    pub fn from_remote(v: &Value) -> Self {
        let status = value_any(v, &["Estado", "estado"]).cloned().unwrap_or(Value::Null);
        Self {
            id: i64_any(v, &["IdUsuario", "idUsuario", "id_usuario", "id"]),
            document_id: normalize::normalize_document_id(
                &str_any(v, &["Documento", "documento"]).unwrap_or_default(),
            ),
            first_name: normalize::normalize_name(
                &str_any(v, &["Nombre", "nombre"]).unwrap_or_default(),
            ),
            last_name: normalize::normalize_name(
                &str_any(v, &["Apellido", "apellido"]).unwrap_or_default(),
            ),
            email: normalize::normalize_email(
                &str_any(v, &["Correo", "correo", "Email", "email"]).unwrap_or_default(),
            ),
            phone: str_any(v, &["Telefono", "telefono"]).unwrap_or_default(),
            address: str_any(v, &["Direccion", "direccion"]).unwrap_or_default(),
            active: normalize::user_status_or_default(&status),
            role_id: i64_any(v, &["IdRol", "idRol", "id_rol"]).unwrap_or(0),
        }
    }

    /// Build this record from its commerce counterpart. Used when a customer
    /// change must materialize or refresh the auth-side account.
    pub fn from_customer(c: &CustomerRecord) -> Self {
        Self {
            id: None,
            document_id: c.document_id.clone(),
            first_name: c.first_name.clone(),
            last_name: c.last_name.clone(),
            email: c.email.clone(),
            phone: c.phone.clone(),
            address: c.address.clone(),
            active: c.active,
            role_id: CUSTOMER_ROLE_ID,
        }
    }

    /// Wire payload in the Users schema. `password` is only attached on
    /// fresh creates; updates never carry credentials.
    pub fn to_payload(&self, password: Option<&str>) -> Value {
        let mut payload = json!({
            "Documento": self.document_id,
            "Nombre": self.first_name,
            "Apellido": self.last_name,
            "Correo": self.email,
            "Telefono": self.phone,
            "Direccion": self.address,
            "Estado": self.active,
            "IdRol": self.role_id,
        });
        if let Some(pw) = password {
            payload["Contrasena"] = Value::String(pw.to_string());
        }
        payload
    }

    pub fn is_customer_capable(&self) -> bool {
        self.role_id == CUSTOMER_ROLE_ID
    }
}

/// Status-only partial payload for the Users schema (boolean form).
pub fn user_status_patch(active: bool) -> Value {
    json!({ "Estado": active })
}

// ---------------------------------------------------------------------------
// Customer records
// ---------------------------------------------------------------------------

/// Canonical shape of a commerce-facing customer profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: Option<i64>,
    pub document_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub active: bool,
    /// Foreign key linking this customer to its owning user, when known.
    pub user_id: Option<i64>,
}

impl CustomerRecord {
    /// Adapt a remote customer payload into the canonical shape.
    pub fn from_remote(v: &Value) -> Self {
        let status = value_any(v, &["Estado", "estado"]).cloned().unwrap_or(Value::Null);
        Self {
            id: i64_any(v, &["IdCliente", "idCliente", "id_cliente", "id"]),
            document_id: normalize::normalize_document_id(
                &str_any(v, &["Documento", "documento"]).unwrap_or_default(),
            ),
            first_name: normalize::normalize_name(
                &str_any(v, &["Nombre", "nombre"]).unwrap_or_default(),
            ),
            last_name: normalize::normalize_name(
                &str_any(v, &["Apellido", "apellido"]).unwrap_or_default(),
            ),
            email: normalize::normalize_email(
                &str_any(v, &["Correo", "correo", "Email", "email"]).unwrap_or_default(),
            ),
            phone: str_any(v, &["Telefono", "telefono"]).unwrap_or_default(),
            address: str_any(v, &["Direccion", "direccion"]).unwrap_or_default(),
            active: normalize::customer_status_or_default(&status),
            user_id: i64_any(v, &["IdUsuario", "idUsuario", "id_usuario"]),
        }
    }

    /// Build this record from its auth counterpart, carrying the user id as
    /// the foreign key.
    pub fn from_user(u: &UserRecord) -> Self {
        Self {
            id: None,
            document_id: u.document_id.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            email: u.email.clone(),
            phone: u.phone.clone(),
            address: u.address.clone(),
            active: u.active,
            user_id: u.id,
        }
    }

    /// Wire payload in the Customers schema (numeric status form).
    pub fn to_payload(&self) -> Value {
        json!({
            "Documento": self.document_id,
            "Nombre": self.first_name,
            "Apellido": self.last_name,
            "Correo": self.email,
            "Telefono": self.phone,
            "Direccion": self.address,
            "Estado": normalize::status_as_number(self.active),
            "IdUsuario": self.user_id,
        })
    }
}

/// Status-only partial payload for the Customers schema (numeric form).
pub fn customer_status_patch(active: bool) -> Value {
    json!({ "Estado": normalize::status_as_number(active) })
}

// ===========================================================================
// Tests
// ===========================================================================
