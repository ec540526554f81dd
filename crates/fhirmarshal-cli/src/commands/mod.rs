pub mod bulk;
pub mod load;
