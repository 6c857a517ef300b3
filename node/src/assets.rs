//! Embedded assets staged onto nodes: the vendored installer and the
//! single-node service unit template. Both are compiled in and treated as
//! read-only text.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tera::{Context, Tera};

use crate::NodeError;

/// Vendored k3s installer, staged into the node's bin directory during
/// prerequisites.
pub const INSTALL_SCRIPT: &str = include_str!("../assets/k3s-install.sh");

const SERVICE_UNIT_TPL: &str = include_str!("../assets/k3s-single.service.tpl");

/// The installer, encoded for shell-safe transport.
pub fn install_script_b64() -> String {
    BASE64.encode(INSTALL_SCRIPT)
}

/// Renders the single-node systemd unit for `config_path`, base64-encoded
/// like every other payload that crosses the wire.
pub fn render_single_service_unit(config_path: &str) -> Result<String, NodeError> {
    let mut tera = Tera::default();
    tera.add_raw_template("k3s-single.service", SERVICE_UNIT_TPL)?;

    let mut context = Context::new();
    context.insert("config_path", config_path);
    let unit = tera.render("k3s-single.service", &context)?;
    Ok(BASE64.encode(unit))
}
