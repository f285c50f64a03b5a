//! Check command implementation.
//!
//! Validates the effective configuration and prints it.

use kubevirt_metrics_collector::{Config, ConfigFormat};

/// Validates `config` and prints it in `format`. Returns the process exit
/// code.
pub fn command_check_config(config: &Config, format: ConfigFormat) -> i32 {
    if let Err(e) = config.validate() {
        eprintln!("❌ Configuration invalid: {}", e);
        return 1;
    }

    match config.render(format) {
        Ok(rendered) => {
            println!("{}", rendered.trim_end());
            println!("✅ Configuration is valid");
            0
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {}", e);
            1
        }
    }
}
