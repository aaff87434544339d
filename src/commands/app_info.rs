use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoResponse {
    pub product_name: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
}

pub fn build_app_info_response(product_name: &str, version: &str) -> AppInfoResponse {
    AppInfoResponse {
        product_name: product_name.to_string(),
        version: version.to_string(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

pub fn app_info() -> AppInfoResponse {
    build_app_info_response(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_info_contains_runtime_metadata() {
        let response = app_info();

        assert_eq!(response.product_name, "market-pulse");
        assert!(!response.version.is_empty());
        assert!(!response.platform.is_empty());
        assert!(!response.arch.is_empty());
    }
}
