pub mod create;
pub mod delete;
pub mod get;
pub mod keypair;
pub mod reconcile;
pub mod replace;
pub mod rolling_update;
pub mod rotate;
pub mod set;
pub mod update;
pub mod validate;
