pub mod peer_table;
