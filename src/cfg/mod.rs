pub mod fs_cfg;
