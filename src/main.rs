/*!
# OTA Gateway

## Help

```bash
ota_gateway help
```

## Example Usage

```bash
ota_gateway --config config
RUST_LOG=ota_gateway=debug OTA_SERVER__PORT=9090 ota_gateway
```

## Dev

To run from source:

```bash
cargo run -- --help
cargo run -- --config config
```
*/

use ota_gateway::gateway;

#[tokio::main]
pub async fn main() -> ota_gateway::Result<()> {
    tracing_subscriber::fmt::init();
    gateway::run().await
}
