pub mod cleanup_list;
pub mod region_list;
