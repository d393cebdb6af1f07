use std::str::FromStr;

use serde::Serialize;

/// Raw wake source as reported by the sleep controller. Discriminants follow
/// `esp_sleep_source_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    Undefined,
    Ext0,
    Ext1,
    Timer,
    Touchpad,
    Ulp,
    Gpio,
    Uart,
    Other(u32),
}

impl WakeCause {
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => Self::Undefined,
            2 => Self::Ext0,
            3 => Self::Ext1,
            4 => Self::Timer,
            5 => Self::Touchpad,
            6 => Self::Ulp,
            7 => Self::Gpio,
            8 => Self::Uart,
            other => Self::Other(other),
        }
    }
}

impl FromStr for WakeCause {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "undefined" | "power-on" | "poweron" => Ok(Self::Undefined),
            "timer" => Ok(Self::Timer),
            "ext0" => Ok(Self::Ext0),
            "ext1" => Ok(Self::Ext1),
            "gpio" => Ok(Self::Gpio),
            "touchpad" => Ok(Self::Touchpad),
            "ulp" => Ok(Self::Ulp),
            "uart" => Ok(Self::Uart),
            other => other
                .parse::<u32>()
                .map(Self::from_raw)
                .map_err(|_| format!("unknown wake cause `{value}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeReason {
    PowerOn,
    Timer,
    ExternalSignal,
    Unknown,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "POWER_ON",
            Self::Timer => "TIMER",
            Self::ExternalSignal => "EXTERNAL_SIGNAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub fn classify(cause: WakeCause) -> WakeReason {
    match cause {
        WakeCause::Undefined => WakeReason::PowerOn,
        WakeCause::Timer => WakeReason::Timer,
        WakeCause::Ext0 | WakeCause::Ext1 | WakeCause::Gpio => WakeReason::ExternalSignal,
        WakeCause::Touchpad | WakeCause::Ulp | WakeCause::Uart | WakeCause::Other(_) => {
            WakeReason::Unknown
        }
    }
}
