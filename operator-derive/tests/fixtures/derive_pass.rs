pub mod conditions {
    #[derive(Clone, Debug, Default)]
    pub struct NBCondition {
        pub reason: String,
    }

    pub trait Conditions {
        fn conditions(&self) -> &Option<Vec<NBCondition>>;
        fn conditions_mut(&mut self) -> &mut Option<Vec<NBCondition>>;
    }
}

#[derive(Default, operator_derive::Conditions)]
pub struct DemoStatus {
    pub conditions: Option<Vec<conditions::NBCondition>>,
    pub message: Option<String>,
}

fn main() {
    use conditions::Conditions as _;
    let mut status = DemoStatus::default();
    assert!(status.conditions().is_none());
    status.conditions_mut().get_or_insert_with(Vec::new);
    assert!(status.conditions().is_some());
}
