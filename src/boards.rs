use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{OtaError, OtaResult};

lazy_static! {
    /// Invitation ports of the boards the gateway can flash out of the box.
    pub static ref DEFAULT_BOARD_PORTS: HashMap<&'static str, u16> = {
        let mut ports = HashMap::new();
        ports.insert("esp8266", 8266);
        ports.insert("esp32", 3232);
        ports
    };
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardInfo {
    pub board: String,
    pub invitation_port: u16,
}

///
/// Board → invitation port table.
///
/// Built once from the defaults plus configured overrides and never
/// changed afterwards.
///
#[derive(Clone, Debug)]
pub struct BoardRegistry {
    ports: BTreeMap<String, u16>,
}

impl Default for BoardRegistry {
    fn default() -> Self {
        BoardRegistry::with_overrides(&HashMap::new())
    }
}

impl BoardRegistry {
    pub fn with_overrides(overrides: &HashMap<String, u16>) -> Self {
        let mut ports: BTreeMap<String, u16> = DEFAULT_BOARD_PORTS
            .iter()
            .map(|(board, port)| (board.to_string(), *port))
            .collect();
        for (board, port) in overrides {
            ports.insert(board.trim().to_lowercase(), *port);
        }
        BoardRegistry { ports }
    }

    pub fn port_for(&self, board: &str) -> OtaResult<u16> {
        self.ports
            .get(&board.trim().to_lowercase())
            .copied()
            .ok_or_else(|| OtaError::UnsupportedBoard(board.to_string()))
    }

    pub fn boards(&self) -> Vec<BoardInfo> {
        self.ports
            .iter()
            .map(|(board, port)| BoardInfo {
                board: board.clone(),
                invitation_port: *port,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        let registry = BoardRegistry::default();
        assert_eq!(registry.port_for("esp8266").unwrap(), 8266);
        assert_eq!(registry.port_for("ESP32").unwrap(), 3232);
        assert!(matches!(
            registry.port_for("rp2040"),
            Err(OtaError::UnsupportedBoard(_))
        ));
    }

    #[test]
    fn overrides_replace_and_extend() {
        let mut overrides = HashMap::new();
        overrides.insert(String::from("esp32"), 4000);
        overrides.insert(String::from(" RP2040 "), 2040);
        let registry = BoardRegistry::with_overrides(&overrides);
        assert_eq!(registry.port_for("esp32").unwrap(), 4000);
        assert_eq!(registry.port_for("rp2040").unwrap(), 2040);
        let boards: Vec<String> = registry.boards().into_iter().map(|b| b.board).collect();
        assert_eq!(boards, vec!["esp32", "esp8266", "rp2040"]);
    }
}
