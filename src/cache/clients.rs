use tracing::debug;

use crate::cache::schema::{CLIENTS, EXTERNAL_REFS};
use crate::core::{ColumnValues, Result, SyncError, Value};
use crate::fields::converters::{email_converter, long_id_converter, phone_converter};
use crate::fields::{ExtRef, ExtRefs, Field, Record, SyncContext, System};
use crate::store::{Predicate, Select, SortOrder, StoreConnection};
use crate::upsert::NamedLocks;

pub const ASS_ID: &str = "AssId";
pub const ACU_ID: &str = "AcuId";
pub const SF_ID: &str = "SfId";
pub const SH_ID: &str = "ShId";
pub const NAME: &str = "Name";
pub const SURNAME: &str = "Surname";
pub const FORENAME: &str = "Forename";
pub const EMAIL: &str = "Email";
pub const PHONE: &str = "Phone";
pub const EXT_REFS: &str = "ExtRefs";
pub const IS_OWNER: &str = "IsOwner";
pub const PRODUCTS: &str = "Products";

/// Client columns holding an external system id, with the id's system.
pub const ID_COLUMNS: [(&str, System); 3] =
    [("cl_ac_id", System::Acu), ("cl_sf_id", System::Sf), ("cl_sh_id", System::Sh)];
pub const CONTACT_COLUMNS: [&str; 3] = ["cl_name", "cl_email", "cl_phone"];

/// Field template of a client, with the names used by every system.
pub fn client_record() -> Record {
    Record::new()
        .with(Field::new(ASS_ID).with_name(System::Ass, "cl_pk"))
        .with(
            Field::new(ACU_ID)
                .with_name(System::Ass, "cl_ac_id")
                .with_name(System::Acu, "CD_CODE")
                .with_name(System::Sh, "MATCHCODE")
                .with_name(System::Sf, "AcumenClientRef__pc"),
        )
        .with(
            Field::new(SF_ID)
                .with_name(System::Ass, "cl_sf_id")
                .with_name(System::Sf, "Id")
                .with_converter(SyncContext::from(System::Sf), long_id_converter),
        )
        .with(
            Field::new(SH_ID)
                .with_name(System::Ass, "cl_sh_id")
                .with_name(System::Sh, "OBJID")
                .with_name(System::Sf, "SihotGuestObjId__pc"),
        )
        .with(Field::new(NAME).with_name(System::Ass, "cl_name").with_name(System::Acu, "CD_SNAM1"))
        .with(Field::new(SURNAME).with_name(System::Sh, "NAME-1").with_name(System::Sf, "LastName"))
        .with(Field::new(FORENAME).with_name(System::Sh, "NAME-2").with_name(System::Sf, "FirstName"))
        .with(
            Field::new(EMAIL)
                .with_name(System::Ass, "cl_email")
                .with_name(System::Acu, "CD_EMAIL")
                .with_name(System::Sh, "EMAIL-1")
                .with_name(System::Sf, "PersonEmail")
                .with_converter(SyncContext::from(System::Sh), email_converter)
                .with_converter(SyncContext::from(System::Acu), email_converter),
        )
        .with(
            Field::new(PHONE)
                .with_name(System::Ass, "cl_phone")
                .with_name(System::Acu, "CD_HTEL1")
                .with_name(System::Sh, "PHONE-1")
                .with_name(System::Sf, "PersonHomePhone")
                .with_converter(SyncContext::from(System::Sh), phone_converter)
                .with_converter(SyncContext::from(System::Acu), phone_converter),
        )
        .with(Field::new(EXT_REFS).with_name(System::Sh, "EXT-REFS").with_name(System::Sf, "ExtRefs__pc"))
        .with(Field::new(IS_OWNER).with_name(System::Ass, "cl_is_owner"))
        .with(Field::new(PRODUCTS).with_name(System::Ass, "cl_products"))
}

/// Identifiers and contact data of one client as known to the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientIdentity {
    pub ass_id: Option<i64>,
    pub acu_id: Option<String>,
    pub sf_id: Option<String>,
    pub sh_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub is_owner: Option<bool>,
    pub products: Option<String>,
    pub ext_refs: ExtRefs,
}

fn text(value: Value) -> Option<String> {
    match value.normalized() {
        Value::Null => None,
        Value::Text(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

impl ClientIdentity {
    pub fn has_external_id(&self) -> bool {
        self.acu_id.is_some() || self.sf_id.is_some() || self.sh_id.is_some()
    }

    /// External id of `system`, if any.
    pub fn id_of(&self, system: System) -> Option<&str> {
        match system {
            System::Ass => None,
            System::Acu => self.acu_id.as_deref(),
            System::Sf => self.sf_id.as_deref(),
            System::Sh => self.sh_id.as_deref(),
        }
    }

    /// Builds the identity from the canonical values of a client record.
    pub fn from_record(rec: &Record) -> Result<Self> {
        let name = text(rec.val(NAME)).or_else(|| {
            let parts: Vec<String> = [FORENAME, SURNAME].iter().filter_map(|f| text(rec.val(f))).collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });
        let ext_refs = match text(rec.val(EXT_REFS)) {
            Some(delimited) => ExtRefs::parse_valid(&delimited),
            None => ExtRefs::new(),
        };
        Ok(Self {
            ass_id: rec.val(ASS_ID).as_i64(),
            acu_id: text(rec.val(ACU_ID)),
            sf_id: text(rec.val(SF_ID)),
            sh_id: text(rec.val(SH_ID)),
            name,
            email: text(rec.val(EMAIL)),
            phone: text(rec.val(PHONE)),
            is_owner: match rec.val(IS_OWNER) {
                Value::Boolean(b) => Some(b),
                _ => None,
            },
            products: text(rec.val(PRODUCTS)),
            ext_refs,
        })
    }

    /// Client record carrying this identity as canonical values.
    pub fn to_record(&self) -> Record {
        let mut rec = client_record();
        rec.set_val(ASS_ID, self.ass_id);
        rec.set_val(ACU_ID, self.acu_id.clone());
        rec.set_val(SF_ID, self.sf_id.clone());
        rec.set_val(SH_ID, self.sh_id.clone());
        rec.set_val(NAME, self.name.clone());
        rec.set_val(EMAIL, self.email.clone());
        rec.set_val(PHONE, self.phone.clone());
        rec.set_val(IS_OWNER, self.is_owner);
        rec.set_val(PRODUCTS, self.products.clone());
        if !self.ext_refs.is_empty() {
            rec.set_val(EXT_REFS, self.ext_refs.to_delimited());
        }
        rec
    }

    pub fn from_columns(row: &ColumnValues, ext_refs: ExtRefs) -> Self {
        let get = |col: &str| row.get(col).cloned().unwrap_or(Value::Null);
        Self {
            ass_id: get("cl_pk").as_i64(),
            acu_id: text(get("cl_ac_id")),
            sf_id: text(get("cl_sf_id")),
            sh_id: text(get("cl_sh_id")),
            name: text(get("cl_name")),
            email: text(get("cl_email")),
            phone: text(get("cl_phone")),
            is_owner: match get("cl_is_owner") {
                Value::Boolean(b) => Some(b),
                _ => None,
            },
            products: text(get("cl_products")),
            ext_refs,
        }
    }

    /// Non-empty client columns, primary key excluded.
    pub fn to_columns(&self) -> ColumnValues {
        let mut cols = ColumnValues::new();
        let mut put = |col: &str, value: Value| {
            if !value.is_empty() {
                cols.insert(col.to_string(), value);
            }
        };
        put("cl_ac_id", self.acu_id.clone().into());
        put("cl_sf_id", self.sf_id.clone().into());
        put("cl_sh_id", self.sh_id.clone().into());
        put("cl_name", self.name.clone().into());
        put("cl_email", self.email.clone().into());
        put("cl_phone", self.phone.clone().into());
        put("cl_is_owner", self.is_owner.into());
        put("cl_products", self.products.clone().into());
        cols
    }
}

pub async fn load_ext_refs(conn: &mut dyn StoreConnection, ass_id: i64) -> Result<ExtRefs> {
    let rows = conn
        .select(&Select::from(EXTERNAL_REFS).filter(Predicate::eq("er_cl_fk", ass_id)))
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let ref_type = row.get("er_type")?.as_str()?;
            let id = row.get("er_id")?.as_str()?;
            Some(ExtRef::new(ref_type, id))
        })
        .collect())
}

/// Clients matching `filter`, with their external references, ordered by primary key.
pub async fn select_clients(conn: &mut dyn StoreConnection, filter: Predicate) -> Result<Vec<ClientIdentity>> {
    let rows = conn
        .select(&Select::from(CLIENTS).filter(filter).order_by("cl_pk", SortOrder::Asc))
        .await?;
    let mut clients = Vec::with_capacity(rows.len());
    for row in rows {
        let ext_refs = match row.get("cl_pk").and_then(Value::as_i64) {
            Some(pk) => load_ext_refs(conn, pk).await?,
            None => ExtRefs::new(),
        };
        clients.push(ClientIdentity::from_columns(&row, ext_refs));
    }
    Ok(clients)
}

pub async fn load_client(conn: &mut dyn StoreConnection, ass_id: i64) -> Result<Option<ClientIdentity>> {
    Ok(select_clients(conn, Predicate::eq("cl_pk", ass_id)).await?.into_iter().next())
}

/// Primary keys of the clients sharing at least one of `ext_refs`, ascending.
pub async fn clients_by_ext_refs(conn: &mut dyn StoreConnection, ext_refs: &ExtRefs) -> Result<Vec<i64>> {
    if ext_refs.is_empty() {
        return Ok(Vec::new());
    }
    let filter = Predicate::Or(
        ext_refs
            .iter()
            .map(|r| Predicate::eq("er_type", r.ref_type.as_str()).and(Predicate::eq("er_id", r.id.as_str())))
            .collect(),
    );
    let rows = conn.select(&Select::from(EXTERNAL_REFS).filter(filter)).await?;
    let mut pks: Vec<i64> = rows.iter().filter_map(|r| r.get("er_cl_fk")?.as_i64()).collect();
    pks.sort_unstable();
    pks.dedup();
    Ok(pks)
}

/// Replaces the whole external reference set of a client (delete then insert).
///
/// Writers of the same client are serialized through `locks`. Runs in its own transaction
/// unless the connection is already inside one.
pub async fn replace_ext_refs(
    conn: &mut dyn StoreConnection,
    locks: &NamedLocks,
    ass_id: i64,
    ext_refs: &ExtRefs,
) -> Result<usize> {
    let _guard = locks.lock(&format!("client:{}", ass_id)).await?;
    let own_transaction = !conn.in_transaction();
    if own_transaction {
        conn.begin().await?;
    }
    match write_ext_refs(conn, ass_id, ext_refs).await {
        Ok(count) => {
            if own_transaction {
                conn.commit().await?;
            }
            debug!(ass_id, count, "external references replaced");
            Ok(count)
        }
        Err(e) => {
            if own_transaction {
                conn.rollback().await?;
            }
            Err(e)
        }
    }
}

async fn write_ext_refs(conn: &mut dyn StoreConnection, ass_id: i64, ext_refs: &ExtRefs) -> Result<usize> {
    conn.delete(EXTERNAL_REFS, &Predicate::eq("er_cl_fk", ass_id)).await?;
    for ext_ref in ext_refs.iter() {
        let mut row = ColumnValues::new();
        row.insert("er_cl_fk".into(), Value::Integer(ass_id));
        row.insert("er_type".into(), Value::from(ext_ref.ref_type.as_str()));
        row.insert("er_id".into(), Value::from(ext_ref.id.as_str()));
        conn.insert(EXTERNAL_REFS, &row).await?;
    }
    Ok(ext_refs.len())
}

/// Primary key from a stored client row.
pub(crate) fn client_pk(row: &ColumnValues) -> Result<i64> {
    row.get("cl_pk")
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncError::Persistence("client row without primary key".into()))
}
