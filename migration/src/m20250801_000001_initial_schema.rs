use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm_migration::sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Users::Admin)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(Users::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        // Create resources table. Bodies are JSON; body_hash deduplicates
        // unchanged bodies across users.
        manager
            .create_table(
                Table::create()
                    .table(Resources::Table)
                    .if_not_exists()
                    .col(string(Resources::ResourceType))
                    .col(string(Resources::ResourceName))
                    .col(string(Resources::Body))
                    .col(string_null(Resources::BodyHash))
                    .col(big_integer_null(Resources::UpdatedAt))
                    .primary_key(
                        Index::create()
                            .col(Resources::ResourceType)
                            .col(Resources::ResourceName),
                    )
                    .to_owned(),
            )
            .await?;

        // Create permissions table
        manager
            .create_table(
                Table::create()
                    .table(Permissions::Table)
                    .if_not_exists()
                    .col(string(Permissions::UserId))
                    .col(string(Permissions::ResourceType))
                    .col(string(Permissions::ResourceName))
                    .primary_key(
                        Index::create()
                            .col(Permissions::UserId)
                            .col(Permissions::ResourceType)
                            .col(Permissions::ResourceName),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Permissions::Table, Permissions::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(
                                Permissions::Table,
                                (Permissions::ResourceType, Permissions::ResourceName),
                            )
                            .to(
                                Resources::Table,
                                (Resources::ResourceType, Resources::ResourceName),
                            ),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_permissions_resource")
                    .table(Permissions::Table)
                    .col(Permissions::ResourceType)
                    .col(Permissions::ResourceName)
                    .to_owned(),
            )
            .await?;

        // Create sync_locks table (leases for the fleet-wide syncer)
        manager
            .create_table(
                Table::create()
                    .table(SyncLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncLocks::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(SyncLocks::Owner))
                    .col(big_integer(SyncLocks::ExpiresAt))
                    .col(
                        ColumnDef::new(SyncLocks::NotBefore)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLocks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Permissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Resources::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Admin,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Resources {
    Table,
    ResourceType,
    ResourceName,
    Body,
    BodyHash,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Permissions {
    Table,
    UserId,
    ResourceType,
    ResourceName,
}

#[derive(DeriveIden)]
enum SyncLocks {
    Table,
    Name,
    Owner,
    ExpiresAt,
    NotBefore,
}
