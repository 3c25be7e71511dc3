//! Provider config entity model
//!
//! SeaORM entity for the provider_configs table. A provider config is a
//! tenant's registration of a catalog provider: the catalog provider name
//! plus OAuth client credentials and custom settings.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Caller-chosen key, unique per environment among non-deleted rows
    pub unique_key: String,

    /// Catalog provider name this config instantiates
    pub provider: String,

    pub environment_id: Uuid,

    /// OAuth client id registered with the provider
    pub oauth_client_id: Option<String>,

    /// Encrypted OAuth client secret
    pub oauth_client_secret_ciphertext: Option<Vec<u8>>,

    /// Provider-specific settings (private keys, app ids)
    #[sea_orm(column_type = "JsonBinary")]
    pub custom: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,

    pub deleted: bool,
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
