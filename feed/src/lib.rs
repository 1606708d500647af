pub mod broker;
pub mod controller;
pub mod facade;
pub mod hook_log;
pub mod mapper;
pub mod queues;
pub mod rules;
pub mod store;
mod titles;
pub mod token_accumulator;
