//! SeaORM Entity for the transfers table
//!
//! One row per cross-chain relay attempt. Rows are created by the flow
//! controller when a trigger arrives and mutated in place until they reach
//! a terminal status; they are never deleted by the relay logic.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transfers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub operation: String,
    pub job_reference: String,
    pub dispute_reference: Option<String>,
    #[sea_orm(unique)]
    pub source_tx_hash: Option<String>,
    pub source_chain_name: String,
    pub source_domain: i32,
    pub status: String,
    pub step: String,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub attestation_message: Option<String>,
    pub attestation_signature: Option<String>,
    pub completion_tx_hash: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
