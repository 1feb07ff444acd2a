pub mod action;
pub mod approval;
pub mod document;
pub mod entity;
pub mod identity;
pub mod task;
