use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "downstream_requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub action: String,
    pub request_method: String,
    pub request_path: String,
    pub request_query: Option<String>,
    pub request_headers_json: Json,
    pub request_body: Option<Vec<u8>>,
    pub client_ip: Option<String>,
    pub received_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
