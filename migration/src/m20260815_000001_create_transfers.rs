//! Migration to create the transfers table for tracking cross-chain relay attempts

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Transfers::Table)
                    .if_not_exists()
                    .col(pk_auto(Transfers::Id))
                    .col(string(Transfers::Operation).not_null())
                    .col(string(Transfers::JobReference).not_null())
                    .col(string_null(Transfers::DisputeReference))
                    .col(string_null(Transfers::SourceTxHash))
                    .col(string(Transfers::SourceChainName).not_null())
                    .col(integer(Transfers::SourceDomain).not_null())
                    .col(string(Transfers::Status).not_null())
                    .col(string(Transfers::Step).not_null())
                    .col(text_null(Transfers::LastError))
                    .col(integer(Transfers::RetryCount).default(0))
                    .col(text_null(Transfers::AttestationMessage))
                    .col(text_null(Transfers::AttestationSignature))
                    .col(string_null(Transfers::CompletionTxHash))
                    .col(
                        timestamp_with_time_zone(Transfers::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Transfers::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Transfers::CompletedAt))
                    .to_owned(),
            )
            .await?;

        // Index for single-shot operation lookups
        manager
            .create_index(
                Index::create()
                    .name("idx_transfers_job_operation")
                    .table(Transfers::Table)
                    .col(Transfers::JobReference)
                    .col(Transfers::Operation)
                    .to_owned(),
            )
            .await?;

        // Index for recovery scans by status
        manager
            .create_index(
                Index::create()
                    .name("idx_transfers_status")
                    .table(Transfers::Table)
                    .col(Transfers::Status)
                    .to_owned(),
            )
            .await?;

        // One relay attempt per source transaction (NULLs are distinct, so
        // payment releases created before event discovery are unaffected)
        manager
            .create_index(
                Index::create()
                    .name("idx_transfers_source_tx_hash")
                    .table(Transfers::Table)
                    .col(Transfers::SourceTxHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Transfers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Transfers {
    Table,
    Id,
    Operation,
    JobReference,
    DisputeReference,
    SourceTxHash,
    SourceChainName,
    SourceDomain,
    Status,
    Step,
    LastError,
    RetryCount,
    AttestationMessage,
    AttestationSignature,
    CompletionTxHash,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
