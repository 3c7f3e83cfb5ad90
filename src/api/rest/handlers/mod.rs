pub mod admin;
pub mod environments;
pub mod resources;
pub mod users;
