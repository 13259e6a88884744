//! Typed flow states and their token encoding.
//!
//! In-process code only ever handles [`FlowState`]. The delimited token
//! (`namespace:step[:param...]`) exists solely at the storage boundary and is
//! produced by [`FlowState::encode`] and parsed by [`FlowState::decode`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use crate::ledger::AccountId;
use crate::settings::SettingKey;

/// Separator between token segments.
pub const DELIMITER: char = ':';

/// Longest parameter accepted inside a token.
pub const MAX_PARAM_LEN: usize = 64;

/// The feature that owns a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Referral code captured before the account finished onboarding.
    Referral,
    /// Operator console.
    Admin,
    /// Voice cloning.
    Clone,
    /// Text-to-speech.
    Tts,
    /// Chat assistant.
    Assistant,
    /// Image generation.
    Image,
    /// Video generation.
    Video,
    /// Support conversation.
    Support,
    /// Anonymous persona chat.
    AnonChat,
}

impl Namespace {
    /// Every namespace.
    pub const ALL: [Self; 9] = [
        Self::Referral,
        Self::Admin,
        Self::Clone,
        Self::Tts,
        Self::Assistant,
        Self::Image,
        Self::Video,
        Self::Support,
        Self::AnonChat,
    ];

    /// Returns the token prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Referral => "ref",
            Self::Admin => "admin",
            Self::Clone => "clone",
            Self::Tts => "tts",
            Self::Assistant => "assistant",
            Self::Image => "image",
            Self::Video => "video",
            Self::Support => "support",
            Self::AnonChat => "anon_chat",
        }
    }

    /// Returns `true` if the raw `token` belongs to this namespace.
    ///
    /// Matches on the leading segment only, never on the whole token.
    #[must_use]
    pub fn owns_token(self, token: &str) -> bool {
        token.split(DELIMITER).next() == Some(self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| SessionError::InvalidToken {
                token: s.to_string(),
            })
    }
}

/// Operator console steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminStep {
    /// Waiting for an account id to inspect.
    UserLookup,
    /// Waiting for the account to top up.
    AddAwaitingTarget,
    /// Waiting for the top-up amount.
    AddAwaitingAmount {
        /// Account being credited.
        target: AccountId,
    },
    /// Waiting for the account to withdraw from.
    SubAwaitingTarget,
    /// Waiting for the withdrawal amount.
    SubAwaitingAmount {
        /// Account being debited.
        target: AccountId,
    },
    /// Waiting for the account whose balance is reset.
    ResetAwaitingTarget,
    /// Waiting for the account to message.
    MessageAwaitingTarget,
    /// Waiting for the message text.
    MessageAwaitingText {
        /// Recipient.
        target: AccountId,
    },
    /// Waiting for the broadcast text.
    BroadcastAwaitingText,
    /// Waiting for a new setting value.
    SetSetting {
        /// Setting being edited.
        key: SettingKey,
    },
}

/// Voice cloning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloneStep {
    /// Waiting for the voice sample.
    AwaitingVoice,
    /// Waiting for the user to confirm the charge.
    AwaitingPayment,
    /// Waiting for the name of the new voice.
    AwaitingName,
}

/// Image and video generation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStep {
    /// Waiting for the prompt.
    AwaitingPrompt,
    /// A generation is running; further prompts are refused.
    Processing,
}

/// Support conversation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportStep {
    /// Waiting for the user's message.
    AwaitingMessage,
    /// Message sent; waiting for an operator.
    Waiting,
}

/// Anonymous chat steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnonChatStep {
    /// Looking for a partner.
    Searching,
    /// Talking to a partner persona. History lives in the scratch store.
    Connected {
        /// Persona identifier.
        persona: String,
    },
}

/// The flow an account is currently in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FlowState {
    /// No active flow; home context.
    #[default]
    Idle,
    /// A referral code arrived before onboarding completed.
    PendingReferral {
        /// The referral code.
        code: String,
    },
    /// Operator console.
    Admin(AdminStep),
    /// Voice cloning.
    Clone(CloneStep),
    /// Text-to-speech, waiting for text to synthesize.
    Tts {
        /// Message holding the voice menu, refreshed after each synthesis.
        menu_message: i64,
        /// Selected voice.
        voice: String,
    },
    /// Chat assistant conversation.
    Assistant,
    /// Image generation.
    Image(GenerationStep),
    /// Video generation.
    Video(GenerationStep),
    /// Support conversation.
    Support(SupportStep),
    /// Anonymous persona chat.
    AnonChat(AnonChatStep),
}

impl FlowState {
    /// Returns the owning namespace, or `None` when idle.
    #[must_use]
    pub const fn namespace(&self) -> Option<Namespace> {
        Some(match self {
            Self::Idle => return None,
            Self::PendingReferral { .. } => Namespace::Referral,
            Self::Admin(_) => Namespace::Admin,
            Self::Clone(_) => Namespace::Clone,
            Self::Tts { .. } => Namespace::Tts,
            Self::Assistant => Namespace::Assistant,
            Self::Image(_) => Namespace::Image,
            Self::Video(_) => Namespace::Video,
            Self::Support(_) => Namespace::Support,
            Self::AnonChat(_) => Namespace::AnonChat,
        })
    }

    /// Returns `true` when no flow is active.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Encodes the state as a storage token. Idle encodes as the empty string.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidParameter`] if an embedded parameter is
    /// empty, too long, or contains the delimiter, whitespace or control
    /// characters.
    pub fn encode(&self) -> Result<String, SessionError> {
        let Some(ns) = self.namespace() else {
            return Ok(String::new());
        };
        let mut segments: Vec<String> = vec![ns.as_str().to_string()];
        match self {
            Self::Idle => {},
            Self::PendingReferral { code } => segments.push(param(code)?),
            Self::Admin(step) => match step {
                AdminStep::UserLookup => segments.push("lookup".into()),
                AdminStep::AddAwaitingTarget => segments.push("add_target".into()),
                AdminStep::AddAwaitingAmount { target } => {
                    segments.extend(["add_amount".into(), target.to_string()]);
                },
                AdminStep::SubAwaitingTarget => segments.push("sub_target".into()),
                AdminStep::SubAwaitingAmount { target } => {
                    segments.extend(["sub_amount".into(), target.to_string()]);
                },
                AdminStep::ResetAwaitingTarget => segments.push("reset_target".into()),
                AdminStep::MessageAwaitingTarget => segments.push("dm_target".into()),
                AdminStep::MessageAwaitingText { target } => {
                    segments.extend(["dm_text".into(), target.to_string()]);
                },
                AdminStep::BroadcastAwaitingText => segments.push("broadcast".into()),
                AdminStep::SetSetting { key } => {
                    segments.extend(["set".into(), key.as_str().to_string()]);
                },
            },
            Self::Clone(step) => segments.push(
                match step {
                    CloneStep::AwaitingVoice => "wait_voice",
                    CloneStep::AwaitingPayment => "wait_payment",
                    CloneStep::AwaitingName => "wait_name",
                }
                .into(),
            ),
            Self::Tts {
                menu_message,
                voice,
            } => segments.extend(["wait_text".into(), menu_message.to_string(), param(voice)?]),
            Self::Assistant => segments.push("chat".into()),
            Self::Image(step) | Self::Video(step) => segments.push(
                match step {
                    GenerationStep::AwaitingPrompt => "wait_prompt",
                    GenerationStep::Processing => "processing",
                }
                .into(),
            ),
            Self::Support(step) => segments.push(
                match step {
                    SupportStep::AwaitingMessage => "await_message",
                    SupportStep::Waiting => "waiting",
                }
                .into(),
            ),
            Self::AnonChat(AnonChatStep::Searching) => segments.push("searching".into()),
            Self::AnonChat(AnonChatStep::Connected { persona }) => {
                segments.extend(["connected".into(), param(persona)?]);
            },
        }
        Ok(segments.join(&DELIMITER.to_string()))
    }

    /// Decodes a storage token. The empty string decodes as [`Self::Idle`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidToken`] for unknown namespaces, unknown
    /// steps, wrong parameter counts or unparsable parameters.
    pub fn decode(token: &str) -> Result<Self, SessionError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(Self::Idle);
        }
        let invalid = || SessionError::InvalidToken {
            token: token.to_string(),
        };
        let segments: Vec<&str> = token.split(DELIMITER).collect();
        let (ns, rest) = segments.split_first().ok_or_else(invalid)?;
        let ns: Namespace = ns.parse().map_err(|_| invalid())?;
        let id = |s: &str| s.parse::<i64>().map(AccountId::new).map_err(|_| invalid());
        let text = |s: &str| param(s).map_err(|_| invalid());

        let state = match (ns, rest) {
            (Namespace::Referral, [code]) => Self::PendingReferral { code: text(code)? },
            (Namespace::Admin, rest) => Self::Admin(match rest {
                ["lookup"] => AdminStep::UserLookup,
                ["add_target"] => AdminStep::AddAwaitingTarget,
                ["add_amount", t] => AdminStep::AddAwaitingAmount { target: id(t)? },
                ["sub_target"] => AdminStep::SubAwaitingTarget,
                ["sub_amount", t] => AdminStep::SubAwaitingAmount { target: id(t)? },
                ["reset_target"] => AdminStep::ResetAwaitingTarget,
                ["dm_target"] => AdminStep::MessageAwaitingTarget,
                ["dm_text", t] => AdminStep::MessageAwaitingText { target: id(t)? },
                ["broadcast"] => AdminStep::BroadcastAwaitingText,
                ["set", key] => AdminStep::SetSetting {
                    key: key.parse().map_err(|_| invalid())?,
                },
                _ => return Err(invalid()),
            }),
            (Namespace::Clone, [step]) => Self::Clone(match *step {
                "wait_voice" => CloneStep::AwaitingVoice,
                "wait_payment" => CloneStep::AwaitingPayment,
                "wait_name" => CloneStep::AwaitingName,
                _ => return Err(invalid()),
            }),
            (Namespace::Tts, ["wait_text", menu, voice]) => Self::Tts {
                menu_message: menu.parse().map_err(|_| invalid())?,
                voice: text(voice)?,
            },
            (Namespace::Assistant, ["chat"]) => Self::Assistant,
            (Namespace::Image, [step]) => Self::Image(generation_step(step).ok_or_else(invalid)?),
            (Namespace::Video, [step]) => Self::Video(generation_step(step).ok_or_else(invalid)?),
            (Namespace::Support, ["await_message"]) => Self::Support(SupportStep::AwaitingMessage),
            (Namespace::Support, ["waiting"]) => Self::Support(SupportStep::Waiting),
            (Namespace::AnonChat, ["searching"]) => Self::AnonChat(AnonChatStep::Searching),
            (Namespace::AnonChat, ["connected", persona]) => {
                Self::AnonChat(AnonChatStep::Connected {
                    persona: text(persona)?,
                })
            },
            _ => return Err(invalid()),
        };
        Ok(state)
    }
}

fn generation_step(step: &str) -> Option<GenerationStep> {
    match step {
        "wait_prompt" => Some(GenerationStep::AwaitingPrompt),
        "processing" => Some(GenerationStep::Processing),
        _ => None,
    }
}

/// Validates a parameter for embedding in a token.
fn checked_param(value: &str) -> Result<&str, SessionError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_PARAM_LEN
        && !value
            .chars()
            .any(|c| c == DELIMITER || c.is_whitespace() || c.is_control());
    if ok {
        Ok(value)
    } else {
        Err(SessionError::InvalidParameter {
            value: value.to_string(),
        })
    }
}

fn param(value: &str) -> Result<String, SessionError> {
    checked_param(value).map(str::to_string)
}
