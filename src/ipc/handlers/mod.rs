pub mod backup_exchange;
pub mod core;
pub mod deliveries;
pub mod groups;
pub mod notifications;
pub mod professors;
pub mod requests;
pub mod students;
pub mod users;
