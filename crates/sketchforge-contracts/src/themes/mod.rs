mod catalog;

pub use catalog::{detect_style, ThemeCatalog, ThemeInfo, ThemeStyle, GENERIC_THEME_NEGATIVE};
