/// Who is acting on a request, taken from the `X-Operator` header.
///
/// Identity is asserted by the caller; authentication happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    operator: String,
}

impl OperatorContext {
    pub const HEADER: &'static str = "x-operator";
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS)
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }
}
