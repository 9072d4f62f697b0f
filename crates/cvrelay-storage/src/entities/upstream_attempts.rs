use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstream_attempts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub attempt_number: i32,
    pub upstream_action: String,
    pub request_headers_json: Json,
    pub request_body: Option<Vec<u8>>,
    pub response_status: Option<i32>,
    pub response_headers_json: Json,
    pub response_body: Option<Vec<u8>>,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub sent_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
