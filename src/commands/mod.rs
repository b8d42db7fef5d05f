// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports fetch, verify and tokens list

pub mod fetch;
pub mod tokens;
pub mod verify;

pub use fetch::fetch;
pub use tokens::tokens_list;
pub use verify::verify;
