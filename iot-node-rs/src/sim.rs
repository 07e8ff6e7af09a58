//! Host stand-ins for the radio and the board

use iot_core::hal::{Diagnostics, Platform};
use iot_core::connectivity::LinkError;
use iot_core::{MacAddress, NetworkDriver};
use rand::Rng;
use std::fs;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// WPA2 passphrases are at least this long
const MIN_PASSPHRASE: usize = 8;

/// File in the data dir holding the simulated MAC
const MAC_FILE: &str = "mac";

/// Simulated station radio.
///
/// The first `fail_first` associations time out. Link drops arrive on the
/// `drops` channel (the console `drop` command).
pub struct SimDriver {
    mac: MacAddress,
    fail_first: u32,
    attempts: u32,
    reject_auth: bool,
    drops: Option<mpsc::UnboundedReceiver<()>>,
}

impl SimDriver {
    pub fn station(mac: MacAddress, fail_first: u32, drops: mpsc::UnboundedReceiver<()>) -> Self {
        Self {
            mac,
            fail_first,
            attempts: 0,
            reject_auth: false,
            drops: Some(drops),
        }
    }

    /// One-shot radio trying the credentials typed into the provisioning peer
    pub fn provisioning(mac: MacAddress, password: &str) -> Self {
        Self {
            mac,
            fail_first: 0,
            attempts: 0,
            reject_auth: password.len() < MIN_PASSPHRASE,
            drops: None,
        }
    }
}

impl NetworkDriver for SimDriver {
    fn associate(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send {
        self.attempts += 1;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(20..200));
        let result = if self.reject_auth {
            Err(LinkError::AuthFailed)
        } else if self.attempts <= self.fail_first {
            Err(LinkError::Timeout)
        } else {
            Ok(())
        };
        debug!("Sim: Association attempt {} -> {:?}", self.attempts, result);

        async move {
            tokio::time::sleep(jitter).await;
            result
        }
    }

    fn wait_link_lost(&mut self) -> impl Future<Output = LinkError> + Send {
        let drops = self.drops.as_mut();
        async move {
            match drops {
                Some(rx) => match rx.recv().await {
                    Some(()) => LinkError::Lost("simulated drop".into()),
                    None => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        }
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }
}

/// Board services on the host; a reset ends the process
pub struct HostPlatform {
    mac: MacAddress,
    reset: AtomicBool,
}

impl HostPlatform {
    pub fn with_mac(mac: MacAddress) -> Self {
        Self {
            mac,
            reset: AtomicBool::new(false),
        }
    }

    /// Reuse the MAC stored in `dir`, generating one on first run.
    ///
    /// A stable MAC keeps the fallback identity and the provisioning
    /// service name the same across restarts.
    pub fn load_or_create(dir: &Path) -> io::Result<Self> {
        let path = dir.join(MAC_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<MacAddress>() {
                Ok(mac) => {
                    debug!("Platform: Using stored MAC {}", mac);
                    return Ok(Self::with_mac(mac));
                }
                Err(e) => warn!("Platform: Replacing stored MAC: {}", e),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mac = random_mac();
        fs::create_dir_all(dir)?;
        fs::write(&path, mac.to_string())?;
        info!("Platform: Generated MAC {}", mac);
        Ok(Self::with_mac(mac))
    }

    pub fn was_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }
}

/// Locally administered unicast MAC
fn random_mac() -> MacAddress {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill(&mut mac[..]);
    mac[0] = (mac[0] & 0xFC) | 0x02;
    MacAddress(mac)
}

impl Platform for HostPlatform {
    fn reset(&self) {
        info!("Platform: Reset requested, exiting");
        self.reset.store(true, Ordering::SeqCst);
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics::default()
    }

    fn sync_clock(&self, timezone: &str) {
        info!("Platform: Host clock already synchronized ({})", timezone);
    }
}
