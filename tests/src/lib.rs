#![cfg(test)]

mod support;

mod assessment;
mod audit;
mod mapping;
