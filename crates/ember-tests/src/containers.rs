//! Disposable PostgreSQL for integration tests.

use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const IMAGE_TAG: &str = "16-alpine";
const DATABASE: &str = "ember";
const USER: &str = "ember";
const PASSWORD: &str = "ember";

/// A PostgreSQL container with an empty `ember` database. The container is
/// stopped when this value is dropped.
pub struct PostgresContainer {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl PostgresContainer {
    pub async fn start() -> anyhow::Result<Self> {
        let container = Postgres::default()
            .with_db_name(DATABASE)
            .with_user(USER)
            .with_password(PASSWORD)
            .with_tag(IMAGE_TAG)
            .start()
            .await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgres://{USER}:{PASSWORD}@{host}:{port}/{DATABASE}");
        tracing::debug!(%url, "postgres container ready");

        Ok(Self {
            _container: container,
            url,
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_container_exposes_ember_database() {
        let pg = PostgresContainer::start().await.unwrap();
        assert!(pg.connection_string().ends_with("/ember"));
    }
}
