pub mod directory;
pub mod run;
pub mod secret;
