mod mysql;

pub use mysql::MySqlJobStore;
