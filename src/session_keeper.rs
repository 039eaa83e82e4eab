// =============================================================================
// Session Keeper — owns authentication state for the broker session
// =============================================================================
//
// Expressed as a plain enum state machine matched in a loop; no async state
// machine library. Every transition logs at info!/warn! with the `state`
// field so a stuck cycle is greppable from the process logs.
// =============================================================================

use std::time::Duration;

use tracing::{info, warn};

use crate::broker::BrokerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    ValidateSso,
    CheckIserver,
    SoftReauth,
    FullRelogin,
    KeepAlive,
}

/// Runs the Session Keeper state machine forever. Never returns under normal
/// operation; every transition recovers or retries, none is fatal.
pub async fn run(broker: BrokerClient) -> ! {
    broker.load_session();
    let mut state = SessionState::ValidateSso;

    loop {
        state = step(&broker, state).await;
    }
}

/// The pure transition table: given the current state and the outcome of
/// whatever call that state makes, what's next, and how long (if at all)
/// should the keeper sleep first. Kept free of I/O so it can be exercised
/// directly in tests without a live broker.
fn next_state(
    state: SessionState,
    outcome: Result<bool, ()>,
) -> (SessionState, Option<Duration>) {
    match state {
        SessionState::ValidateSso => match outcome {
            Ok(true) => (SessionState::CheckIserver, None),
            Ok(false) | Err(()) => (SessionState::FullRelogin, None),
        },
        SessionState::CheckIserver => match outcome {
            Err(()) => (SessionState::ValidateSso, Some(Duration::from_secs(10))),
            Ok(true) => (SessionState::KeepAlive, None),
            Ok(false) => (SessionState::SoftReauth, None),
        },
        SessionState::SoftReauth => match outcome {
            Ok(true) => (SessionState::KeepAlive, None),
            Ok(false) | Err(()) => (SessionState::FullRelogin, None),
        },
        SessionState::FullRelogin => match outcome {
            Ok(true) => (SessionState::ValidateSso, None),
            Ok(false) | Err(()) => (SessionState::ValidateSso, Some(Duration::from_secs(10))),
        },
        SessionState::KeepAlive => match outcome {
            Ok(true) => (SessionState::ValidateSso, None),
            Ok(false) | Err(()) => (SessionState::ValidateSso, Some(Duration::from_secs(3))),
        },
    }
}

async fn step(broker: &BrokerClient, state: SessionState) -> SessionState {
    let outcome: Result<bool, ()> = match state {
        SessionState::ValidateSso => {
            info!(state = "validate_sso", "validating SSO session");
            match broker.sso_validate().await {
                Ok(ok) => Ok(ok),
                Err(err) => {
                    warn!(state = "validate_sso", %err, "sso_validate transport error");
                    Err(())
                }
            }
        }

        SessionState::CheckIserver => {
            info!(state = "check_iserver", "checking iserver auth status");
            match broker.iserver_auth_status().await {
                Ok(ok) => Ok(ok),
                Err(err) => {
                    warn!(state = "check_iserver", %err, "iserver/auth/status transport error");
                    Err(())
                }
            }
        }

        SessionState::SoftReauth => {
            info!(state = "soft_reauth", "iserver not authenticated, attempting soft reauth");
            match broker.init_iserver_session().await {
                Ok(ok) => Ok(ok),
                Err(err) => {
                    warn!(state = "soft_reauth", %err, "init_iserver_session error");
                    Err(())
                }
            }
        }

        SessionState::FullRelogin => {
            warn!(state = "full_relogin", "performing full relogin");
            let _ = broker.portal_logout().await;
            let _ = broker.sso_logout().await;
            match broker.obtain_session().await {
                Ok(ok) => Ok(ok),
                Err(_) => {
                    warn!(state = "full_relogin", "obtain_session failed, waiting before retry");
                    Err(())
                }
            }
        }

        SessionState::KeepAlive => {
            info!(state = "keep_alive", "session good");
            tokio::time::sleep(Duration::from_secs(1)).await;
            match broker.keep_session_alive().await {
                Ok(()) => Ok(true),
                Err(err) => {
                    warn!(state = "keep_alive", %err, "tickle failed");
                    Ok(false)
                }
            }
        }
    };

    let (next, sleep_for) = next_state(state, outcome);
    if let Some(d) = sleep_for {
        tokio::time::sleep(d).await;
    }
    next
}
