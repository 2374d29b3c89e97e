/*!

# HTTP Interface

## Introduction

The gateway exposes the firmware catalog and the upload orchestrator over a small JSON API served by warp. Every route maps onto exactly one catalog or orchestrator operation; no business rule lives in this module.

## Routes

```text
GET     /firmwares                                  list firmware records
POST    /firmwares?board=&type=&version=            store a firmware, raw body is the binary
PATCH   /firmwares/{id}                             change board, type or version
DELETE  /firmwares/{id}                             remove record and binary
GET     /firmwares/{id}/binary                      download the binary
GET     /boards                                     supported boards and their invitation ports
POST    /uploads                                    {"firmwareId": id, "devices": [selector, ...]}
GET     /uploads                                    uploads still in progress
DELETE  /uploads/{taskId}                           abort an upload
GET     /uploads/events                             websocket, one JSON text frame per progress event
```

## Errors

Failed requests answer with

```json
{"error": "not_found", "message": "firmware 0d4c... not found"}
```

and the status of the error kind: `validation` 400, `not_found` 404, `conflict` 409, `unsupported_board` and `board_mismatch` 422, everything else 500.

## Uploads

`POST /uploads` always answers 200 with one entry per requested device, so one bad device does not hide the others:

```json
{
  "kitchen-sensor": {"taskId": "5b0e..."},
  "garage-door": {"taskId": null, "error": "device garage-door not found"}
}
```

## Progress events

```json
{"taskId": "5b0e...", "status": "FIRMWARE_TRANSFER", "progress": 39}
```

`progress` is `null` for state transitions.

*/

pub mod filters;
pub mod handlers;
pub mod socket;
