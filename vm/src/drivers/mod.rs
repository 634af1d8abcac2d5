pub mod ram_disk;
