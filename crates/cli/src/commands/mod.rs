pub mod load;
pub mod nodes;
pub mod render;
