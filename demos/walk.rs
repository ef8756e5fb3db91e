//! Example: Connect to a controller, list its processor and every device the
//! walk finds, then print button presses until Ctrl+C.
//!
//! ```text
//! cargo run --example walk -- 192.168.1.40 ca.pem cert.pem key.pem
//! ```

use std::path::Path;

use leap_bridge::{
    BridgeOptions, ButtonWiring, Credentials, LeapConnection, Session, SessionOptions, walk,
};
use leap_bridge::transport::TlsConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [host, ca, cert, key] = args.as_slice() else {
        anyhow::bail!("usage: walk <host> <ca.pem> <cert.pem> <key.pem>");
    };

    let credentials = Credentials::from_files(Path::new(ca), Path::new(cert), Path::new(key))?;
    let options = SessionOptions::default();
    let connector = TlsConnector::new(host.as_str(), options.port, &credentials)?;
    let connection = LeapConnection::new(std::sync::Arc::new(connector), options.request_timeout);
    let session = Session::new(host.as_str(), connection, options);

    println!("Connecting to {host}...");
    session.connect().await?;

    let info = session.processor_info().await?;
    println!("\n--- Processor ---");
    println!("  Name: {}", info.name);
    println!("  Model: {} ({})", info.model, info.manufacturer);
    println!("  Serial: {}", info.serial_number);
    println!("  Firmware: {}", info.firmware_revision);

    let (wiring, mut actions) = ButtonWiring::new(BridgeOptions::default());
    let report = walk(&session, &wiring).await?;

    println!("\n--- Wired ({}) ---", report.wired.len());
    for name in &report.wired {
        println!("  {name}");
    }
    println!("\n--- Skipped ({}) ---", report.skipped.len());
    for name in &report.skipped {
        println!("  {name}");
    }
    if !report.failed.is_empty() || report.read_errors > 0 {
        println!(
            "\n{} devices failed, {} reads failed",
            report.failed.len(),
            report.read_errors
        );
    }

    println!("\nPress buttons, or Ctrl+C to disconnect...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(action) = actions.recv() => println!(
                "  {:20} {:12} #{:<2} {}",
                action.device,
                action.label,
                action.button_number,
                action.kind.as_str(),
            ),
        }
    }

    session.close().await;
    println!("Disconnected.");
    Ok(())
}
