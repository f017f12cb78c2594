pub mod communication_manager;
pub mod symbols;
