/*!
# Welcome to the OTA Gateway

The gateway sits between a local network of embedded devices and a remote control plane. This crate holds its firmware delivery core: a persisted firmware catalog backed by a blob store, and an upload orchestrator that pushes firmware images to devices over the network OTA protocol.

# The OTA protocol

An upload runs in two phases:

```text
gateway                                    device
   | --- UDP "0 <port> <length> <md5>" --->  |   invitation
   | <-------------- "OK" ------------------ |
   | <========= TCP connect to <port> ====== |
   | === 1024 byte chunk ==================> |   transfer
   | <========= 4 byte acknowledgement ===== |   (repeated)
   | <================= "OK" =============== |   confirmation
```

Every upload is an `ota::task::UploadTask` owned by a worker of the `ota::orchestrator::UploadOrchestrator`. State changes and progress are pushed to a `progress::ProgressSink`.

# Usage

```bash
ota_gateway --config config
otacli publish --board esp32 --type app --version 1.2.0 --file build/app.bin
otacli flash --firmware <id> --device kitchen-sensor
otacli watch
```
*/
#[macro_use]
extern crate lazy_static;

pub mod boards;
pub mod catalog;
pub mod device;
pub mod error;
pub mod firmware;
pub mod gateway;
pub mod networking;
pub mod ota;
pub mod progress;
pub mod settings;
pub mod signals;
pub mod storage;
pub mod time;

#[cfg(test)]
pub mod test_setup;
#[cfg(test)]
pub mod test_utilities;

/// Error returned by most functions.
///
/// Domain operations return `error::OtaError`. The process-level glue
/// (startup, configuration, the server loop) boxes whatever it meets.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for the gateway runtime.
pub type Result<T> = std::result::Result<T, Error>;
