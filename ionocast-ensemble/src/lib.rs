pub mod backtest;
pub mod climatology;
pub mod config;
pub mod display;
pub mod ensemble;
pub mod error;
pub mod history;
pub mod regions;
pub mod risk;
pub mod synthetic;
