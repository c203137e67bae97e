pub mod ex_flash;
pub mod ram_flash;
pub mod storage;
