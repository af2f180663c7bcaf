/// Where the crowdrun database lives and how many connections a process
/// may hold to it.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Pool size. Every agent of a running task run writes its exchanges
    /// through this pool.
    pub max_connections: u32,
}

impl DbConfig {
    /// Environment variable that overrides the configured URL.
    pub const ENV_VAR: &str = "CROWDRUN_DATABASE_URL";

    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/crowdrun";

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Database every server has, used to create the crowdrun one.
    const MAINTENANCE_DB: &str = "postgres";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Zero keeps the current size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        if max_connections > 0 {
            self.max_connections = max_connections;
        }
        self
    }

    /// Server part and database part of the URL.
    fn split_url(&self) -> (&str, &str) {
        match self.database_url.rsplit_once('/') {
            Some((server, rest)) => (server, rest.split('?').next().unwrap_or_default()),
            None => (self.database_url.as_str(), ""),
        }
    }

    /// Database name from the URL, without any query string.
    pub fn database_name(&self) -> Option<&str> {
        Some(self.split_url().1).filter(|name| !name.is_empty())
    }

    /// Same server, maintenance database.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rsplit_once('/') {
            Some((server, _)) => format!("{server}/{}", Self::MAINTENANCE_DB),
            None => self.database_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_names_the_crowdrun_database() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL);
        assert_eq!(cfg.database_name(), Some("crowdrun"));
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn database_name_ignores_query() {
        let cfg = DbConfig::new("postgres://db:5432/runs?sslmode=disable");
        assert_eq!(cfg.database_name(), Some("runs"));
        assert_eq!(cfg.maintenance_url(), "postgres://db:5432/postgres");
    }

    #[test]
    fn url_without_database() {
        let cfg = DbConfig::new("postgres://db:5432/");
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn zero_pool_size_is_ignored() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL).with_max_connections(0);
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_MAX_CONNECTIONS);
        assert_eq!(cfg.with_max_connections(32).max_connections, 32);
    }
}
