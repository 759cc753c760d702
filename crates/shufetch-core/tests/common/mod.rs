pub mod shuffle_server;
