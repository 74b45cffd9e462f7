pub mod tests {
    use std::time::Duration;

    use crate::{ExecutionMode, FunctionConfig, FunctionConfigBuilder, RuntimeRequest};

    pub const TEST_FUNCTION: &str = "echo";
    pub const TEST_CODE_PATH: &str = "/srv/functions/echo.py";

    pub fn mock_function_config(name: &str, min_instances: u32, max_instances: u32) -> FunctionConfig {
        FunctionConfigBuilder::default()
            .name(name.to_string())
            .code_path(TEST_CODE_PATH.to_string())
            .execution_mode(ExecutionMode::Process)
            .timeout(Duration::from_secs(5))
            .min_instances(min_instances)
            .max_instances(max_instances)
            .build()
            .unwrap()
    }

    pub fn mock_function_config_with_timeout(name: &str, timeout: Duration) -> FunctionConfig {
        FunctionConfig {
            timeout,
            ..mock_function_config(name, 0, 1)
        }
    }

    pub fn mock_request(body: &str) -> RuntimeRequest {
        RuntimeRequest::new("POST", "/")
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }
}
