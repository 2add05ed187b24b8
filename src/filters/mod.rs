pub mod adaptive;
pub mod fuel_ekf;
