use diffbackup::{InfoEvent, PlayerRegistry};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Online players as reported by the server output
#[derive(Default)]
pub struct OnlinePlayers {
    online: Mutex<BTreeSet<String>>,
}

impl OnlinePlayers {
    pub fn apply(&self, event: &InfoEvent) {
        let Ok(mut online) = self.online.lock() else {
            return;
        };
        match event {
            InfoEvent::PlayerJoined(name) => {
                online.insert(name.clone());
            }
            InfoEvent::PlayerLeft(name) => {
                online.remove(name);
            }
            InfoEvent::SaveCompleted => {}
        }
    }

    /// Forget everyone; the server went down
    pub fn clear(&self) {
        if let Ok(mut online) = self.online.lock() {
            online.clear();
        }
    }
}

impl PlayerRegistry for OnlinePlayers {
    fn has_any_player(&self) -> bool {
        self.online.lock().map(|o| !o.is_empty()).unwrap_or(false)
    }

    fn list_players(&self) -> Vec<String> {
        self.online
            .lock()
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default()
    }
}
