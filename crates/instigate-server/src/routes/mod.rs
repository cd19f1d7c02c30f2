pub mod info;
pub mod instigators;
