//! 回显演示：在内存引擎上监听、建连并往返一条消息。
//!
//! 运行：`RUST_LOG=spark_transport_srt=debug cargo run -p spark-transport-srt --example echo`

use spark_transport_srt::{
    CallContext, MemoryEngine, Options, ShutdownDirection, SrtConfig, SrtError, SrtTransport,
};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
dial_timeout_ms = 1000

[options]
latency = "120"
"#;

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<(), SrtError> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .init();

    let srt = SrtTransport::new(MemoryEngine::new()).with_config(SrtConfig::from_toml_str(CONFIG)?);
    let ln = srt.listen("srt", "127.0.0.1:0").await?;
    tracing::info!(addr = %ln.addr(), "echo server listening");

    let server = {
        let ln = ln.clone();
        tokio::spawn(async move {
            let conn = ln.accept().await?;
            let mut buf = [0u8; 1024];
            loop {
                let read = conn.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                conn.write(&buf[..read]).await?;
            }
            conn.close()
        })
    };

    let ctx = CallContext::new().with_options(Options::new().set("payloadsize", "1316"));
    let client = srt
        .dialer()
        .dial_context(&ctx, "srt", &ln.addr().to_string())
        .await?;
    let message = b"hello over srt";
    client.write(message).await?;
    client.shutdown(ShutdownDirection::Write)?;

    let mut echoed = [0u8; 14];
    client.read_full(&mut echoed).await?;
    tracing::info!(echoed = %String::from_utf8_lossy(&echoed), "echo received");

    match server.await {
        Ok(result) => result?,
        Err(join) => tracing::error!(error = %join, "echo server task failed"),
    }
    client.close()?;
    ln.close()
}
