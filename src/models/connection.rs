//! Connection entity model
//!
//! SeaORM entity for the connections table, storing end-user authorizations
//! against a provider config. Credentials are stored as an encrypted blob;
//! soft-deleted rows keep their identity but have the blob wiped.

use super::provider_config::Entity as ProviderConfig;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Surrogate primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Caller-chosen connection identifier, unique per provider config and
    /// environment among non-deleted rows
    pub connection_id: String,

    /// Key of the provider config this connection authorizes against
    pub provider_config_key: String,

    /// Foreign key to the provider config row
    pub config_id: Uuid,

    /// Environment scoping the connection
    pub environment_id: Uuid,

    /// Encrypted serialized credential blob
    pub credentials_ciphertext: Option<Vec<u8>>,

    /// Per-connection template values (subdomains, account IDs)
    #[sea_orm(column_type = "JsonBinary")]
    pub connection_config: Option<JsonValue>,

    /// Caller-managed opaque metadata
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,

    /// Last time credentials were served or a refresh was attempted
    pub last_fetched_at: Option<DateTimeWithTimeZone>,

    /// Soft-delete marker; deleted rows never resolve
    pub deleted: bool,
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "ProviderConfig",
        from = "Column::ConfigId",
        to = "super::provider_config::Column::Id"
    )]
    ProviderConfig,
}

impl Related<ProviderConfig> for Entity {
    fn to() -> RelationDef {
        Relation::ProviderConfig.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
