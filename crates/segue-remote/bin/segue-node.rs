//! Processing node entry point.
//!
//! Hosts compiled units for remote sessions. The builtin compiler stands in
//! until a real DSP toolchain is wired up behind `UnitCompiler`.

use segue_core::BuiltinCompiler;
use segue_remote::NodeServer;
use std::env;
use std::sync::Arc;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:7351".to_string());

    let server = NodeServer::bind(&addr, Arc::new(BuiltinCompiler::new()))?;
    tracing::info!(addr = %server.addr(), "segue node ready");

    // Serve until killed.
    loop {
        std::thread::park();
    }
}
