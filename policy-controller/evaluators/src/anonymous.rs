use anyhow::Result;
use authpolicy_controller_core::{PipelineState, VerifyIdentity};
use serde_json::{Map, Value};

/// Accepts every request with an empty identity.
#[derive(Copy, Clone, Debug, Default)]
pub struct Anonymous;

#[async_trait::async_trait]
impl VerifyIdentity for Anonymous {
    async fn call(&self, _: &PipelineState) -> Result<Value> {
        Ok(Value::Object(Map::new()))
    }
}
