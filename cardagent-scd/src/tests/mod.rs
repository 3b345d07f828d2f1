// SPDX-FileCopyrightText: 2025 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use secrecy::SecretString;

use crate::config::{Config, default_homedir};
use crate::error::{Result, ScdError};
use crate::inquiry::PinPrompt;
use crate::pincache::PinCache;
use crate::registry::Registry;

use self::fake_daemon::FakeLauncher;

mod fake_daemon;

pub fn test_config() -> Config {
    Config {
        homedir: default_homedir(),
        ..Config::default()
    }
}

pub fn test_registry(launcher: &Arc<FakeLauncher>, cache: Arc<dyn PinCache>) -> Registry {
    Registry::new(test_config(), Box::new(launcher.clone()), cache)
}

/// Wait for the daemon reaper to finish its cleanup.
pub async fn wait_until_stopped(registry: &Registry) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("daemon exit was not observed");
}

/// PIN prompt answering from a queue and recording what it was asked.
#[derive(Default)]
pub struct ScriptedPrompt {
    pins: Mutex<VecDeque<String>>,
    pub asked: Mutex<Vec<(Option<String>, String)>>,
    pub pinpad: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn with_pins<const N: usize>(pins: [&str; N]) -> Self {
        Self {
            pins: Mutex::new(pins.iter().map(|pin| pin.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn asked(&self) -> Vec<(Option<String>, String)> {
        self.asked.lock().unwrap().clone()
    }

    pub fn pinpad_events(&self) -> Vec<String> {
        self.pinpad.lock().unwrap().clone()
    }
}

impl PinPrompt for ScriptedPrompt {
    fn get_pin<'a>(
        &'a self,
        desc: Option<&'a str>,
        info: &'a str,
        _max_len: usize,
    ) -> BoxFuture<'a, Result<SecretString>> {
        self.asked
            .lock()
            .unwrap()
            .push((desc.map(str::to_string), info.to_string()));
        let pin = self.pins.lock().unwrap().pop_front();
        Box::pin(async move {
            pin.map(SecretString::from)
                .ok_or_else(|| ScdError::PinEntry("no PIN entered".to_string()))
        })
    }

    fn show_pinpad<'a>(&'a self, _desc: Option<&'a str>, info: &'a str) -> BoxFuture<'a, Result<()>> {
        self.pinpad.lock().unwrap().push(format!("show {info}"));
        Box::pin(async { Ok(()) })
    }

    fn dismiss_pinpad(&self) -> BoxFuture<'_, Result<()>> {
        self.pinpad.lock().unwrap().push("dismiss".to_string());
        Box::pin(async { Ok(()) })
    }
}
