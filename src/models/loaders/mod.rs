pub mod toml_loader;

pub use toml_loader::{load_items_file, ItemsFile};
