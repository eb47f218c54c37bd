//! Dashboard assets shared by both front-ends.

use std::net::Ipv4Addr;

pub const INDEX_HTML: &str = include_str!("../www/index.html");
pub const STYLE_CSS: &str = include_str!("../www/style.css");
pub const MAIN_JS: &str = include_str!("../www/main.js");

pub const ADDRESS_PLACEHOLDER: &str = "__IPADDRESS_VALUE__";

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const CSS_CONTENT_TYPE: &str = "text/css";
pub const JS_CONTENT_TYPE: &str = "application/javascript";

/// Points the dashboard script at the address the device is reachable on.
pub fn render_script(template: &str, address: Ipv4Addr) -> String {
    template.replace(ADDRESS_PLACEHOLDER, &address.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn script_carries_the_dashboard_address() {
        let script = render_script(MAIN_JS, Ipv4Addr::new(192, 168, 1, 10));

        assert!(!script.contains(ADDRESS_PLACEHOLDER));
        assert!(script.contains("const DEVICE_ADDRESS = \"192.168.1.10\";"));
    }

    #[test]
    fn every_placeholder_is_replaced() {
        let template = "a=__IPADDRESS_VALUE__;b=__IPADDRESS_VALUE__";

        assert_eq!(
            render_script(template, Ipv4Addr::new(10, 0, 0, 40)),
            "a=10.0.0.40;b=10.0.0.40"
        );
    }

    #[test]
    fn dashboard_requests_the_served_stylesheet_and_script() {
        assert!(INDEX_HTML.contains("href=\"/style.css\""));
        assert!(INDEX_HTML.contains("src=\"/main.js\""));
    }
}
