pub mod approval;
pub mod budget;
pub mod classify;
pub mod doctor;
pub mod onboard;
pub mod run;
pub mod status;
