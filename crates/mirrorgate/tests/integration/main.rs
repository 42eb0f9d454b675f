mod cli;
mod server;
mod utils;
