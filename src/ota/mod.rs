/*!
# Over-the-air firmware delivery

`UploadOrchestrator` validates upload requests, keeps at most one running
`UploadTask` per device and runs the tasks on a bounded set of workers.
`UploadTask` drives one transfer through the states in `state` using the
wire format in `protocol`.
*/

pub mod orchestrator;
pub mod protocol;
pub mod state;
pub mod task;
