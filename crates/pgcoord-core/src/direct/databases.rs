use super::{decode_error, procedure_error, DirectClient};
use crate::catalog::pg::database_from_row;
use crate::catalog::DatabaseCatalog;
use crate::error::{classify_postgres_error, Result};
use crate::models::DatabaseRegistration;

impl DirectClient {
    /// Calls a text-returning registration procedure with one database name.
    fn call_procedure(&mut self, procedure: &str, datname: Option<&str>) -> Result<String> {
        let sql = match datname {
            Some(_) => format!("SELECT {}.{}($1)", self.schema, procedure),
            None => format!("SELECT {}.{}()", self.schema, procedure),
        };
        let client = self.client()?;
        let row = match datname {
            Some(name) => client.query_one(&sql, &[&name]),
            None => client.query_one(&sql, &[]),
        }
        .map_err(|e| procedure_error(&e))?;
        let message: Option<String> = row.try_get(0).map_err(decode_error)?;
        Ok(message.unwrap_or_default())
    }
}

impl DatabaseCatalog for DirectClient {
    fn register_db(&mut self, datname: &str) -> Result<String> {
        self.call_procedure("register_db", Some(datname))
    }

    fn unregister_db(&mut self, datname: &str) -> Result<String> {
        self.call_procedure("unregister_db", Some(datname))
    }

    fn enable_db(&mut self, datname: &str) -> Result<String> {
        self.call_procedure("enable_db", Some(datname))
    }

    fn disable_db(&mut self, datname: &str) -> Result<String> {
        self.call_procedure("disable_db", Some(datname))
    }

    fn list_databases(&mut self) -> Result<Vec<DatabaseRegistration>> {
        let sql = format!(
            "SELECT datname, registered_at, enabled, options \
             FROM {}.databases ORDER BY datname",
            self.schema
        );
        let rows = self
            .client()?
            .query(&sql, &[])
            .map_err(|e| classify_postgres_error(&e))?;
        rows.iter()
            .map(|row| database_from_row(row).map_err(decode_error))
            .collect()
    }

    fn enabled_databases(&mut self) -> Result<Option<String>> {
        let sql = format!("SELECT {}.get_enabled_databases()", self.schema);
        let row = self
            .client()?
            .query_one(&sql, &[])
            .map_err(|e| classify_postgres_error(&e))?;
        let enabled: Option<String> = row.try_get(0).map_err(decode_error)?;
        Ok(enabled.filter(|s| !s.is_empty()))
    }

    fn register_current_db(&mut self) -> Result<String> {
        self.call_procedure("register_current_db", None)
    }
}
