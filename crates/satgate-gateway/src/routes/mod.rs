pub mod admin;
pub mod decision;
pub mod gateway;
pub mod health;
