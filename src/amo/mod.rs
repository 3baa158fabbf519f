pub mod client;
pub mod session;

pub use client::{AmoClient, CrmApi, Lead, User};
pub use session::{AmoConfig, AmoSession, CrmError};
