pub mod descriptor;
pub mod descriptor_pool;
