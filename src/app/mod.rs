pub mod adb;
pub mod capabilities;
pub mod config;
pub mod control;
pub mod crawler;
pub mod device;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod models;
pub mod screen;
pub mod session;
pub mod store;
pub mod ui_capture;
pub mod ui_xml;
pub mod webdriver;
