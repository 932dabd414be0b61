#![allow(dead_code)]
pub mod conditions {
    pub struct NBCondition;

    pub trait Conditions {
        fn conditions(&self) -> &Option<Vec<NBCondition>>;
        fn conditions_mut(&mut self) -> &mut Option<Vec<NBCondition>>;
    }
}

#[derive(operator_derive::Conditions)]
pub struct MissingFieldStatus {
    pub entries: Vec<String>,
}

fn main() {}
