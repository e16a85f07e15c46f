pub mod control;
pub mod list_models;
pub mod multi_run;
pub mod single_run;
