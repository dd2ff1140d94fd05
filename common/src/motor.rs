use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info, warn};

use crate::config::MotorConfig;

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("failed to access GPIO: {0}")]
    Gpio(#[from] rppal::gpio::Error),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Chassis-level command accepted from the control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    /// Wheel rotations for (left, right). Turning spins the wheels in
    /// opposite directions.
    pub fn wheels(self) -> (Rotation, Rotation) {
        match self {
            Direction::Forward => (Rotation::Forward, Rotation::Forward),
            Direction::Backward => (Rotation::Backward, Rotation::Backward),
            Direction::Left => (Rotation::Backward, Rotation::Forward),
            Direction::Right => (Rotation::Forward, Rotation::Backward),
            Direction::Stop => (Rotation::Coast, Rotation::Coast),
        }
    }
}

impl FromStr for Direction {
    type Err = MotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "stop" => Ok(Direction::Stop),
            other => Err(MotorError::InvalidCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Direction of a single wheel, as driven through the two L298N inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Forward,
    Backward,
    Coast,
}

impl Rotation {
    /// Input pin levels (IN_A, IN_B); `true` is high.
    pub fn input_levels(self) -> (bool, bool) {
        match self {
            Rotation::Forward => (true, false),
            Rotation::Backward => (false, true),
            Rotation::Coast => (false, false),
        }
    }
}

/// PWM duty cycle in percent, always within 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Speed(u8);

impl Speed {
    pub const ZERO: Speed = Speed(0);
    pub const FULL: Speed = Speed(100);

    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Speed::ZERO;
        }
        Speed(value.round().clamp(0.0, 100.0) as u8)
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    pub fn duty_cycle(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl From<u8> for Speed {
    fn from(value: u8) -> Self {
        Speed(value.min(100))
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// A two-wheel differential drive.
pub trait MotorDriver: Send + Sync {
    fn set_wheel(&self, side: Side, rotation: Rotation, speed: Speed) -> Result<(), MotorError>;

    /// Human-readable hardware name for status reporting.
    fn name(&self) -> &str {
        "motor driver"
    }

    fn drive(&self, direction: Direction, speed: Speed) -> Result<(), MotorError> {
        let speed = if direction == Direction::Stop {
            Speed::ZERO
        } else {
            speed
        };
        let (left, right) = direction.wheels();
        self.set_wheel(Side::Left, left, speed)?;
        self.set_wheel(Side::Right, right, speed)?;
        Ok(())
    }

    fn stop(&self) -> Result<(), MotorError> {
        self.drive(Direction::Stop, Speed::ZERO)
    }
}

struct Wheel {
    in_a: OutputPin,
    in_b: OutputPin,
    enable: OutputPin,
}

impl Wheel {
    fn claim(gpio: &Gpio, in_a: u8, in_b: u8, enable: u8) -> Result<Self, MotorError> {
        Ok(Self {
            in_a: gpio.get(in_a)?.into_output_low(),
            in_b: gpio.get(in_b)?.into_output_low(),
            enable: gpio.get(enable)?.into_output_low(),
        })
    }

    fn apply(&mut self, rotation: Rotation, speed: Speed, frequency: f64) -> Result<(), MotorError> {
        let (a, b) = rotation.input_levels();
        set_level(&mut self.in_a, a);
        set_level(&mut self.in_b, b);
        self.enable.set_pwm_frequency(frequency, speed.duty_cycle())?;
        Ok(())
    }
}

fn set_level(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

/// L298N driver on the Pi's GPIO header, speed set by software PWM on the
/// enable pins.
pub struct GpioMotorDriver {
    left: Mutex<Wheel>,
    right: Mutex<Wheel>,
    frequency: f64,
}

impl GpioMotorDriver {
    pub fn open(config: &MotorConfig) -> Result<Self, MotorError> {
        let gpio = Gpio::new()?;
        let left = Wheel::claim(&gpio, config.left_in1, config.left_in2, config.left_en)?;
        let right = Wheel::claim(&gpio, config.right_in3, config.right_in4, config.right_en)?;

        let driver = Self {
            left: Mutex::new(left),
            right: Mutex::new(right),
            frequency: config.pwm_frequency_hz,
        };
        driver.stop()?;

        info!(
            in1 = config.left_in1,
            in2 = config.left_in2,
            en = config.left_en,
            "left motor ready"
        );
        info!(
            in3 = config.right_in3,
            in4 = config.right_in4,
            en = config.right_en,
            "right motor ready"
        );
        Ok(driver)
    }
}

impl MotorDriver for GpioMotorDriver {
    fn set_wheel(&self, side: Side, rotation: Rotation, speed: Speed) -> Result<(), MotorError> {
        let wheel = match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        };
        let mut wheel = wheel.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(%side, ?rotation, %speed, "set wheel");
        wheel.apply(rotation, speed, self.frequency)
    }

    fn name(&self) -> &str {
        "L298N"
    }
}

impl Drop for GpioMotorDriver {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop motors while releasing GPIO");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Side, Rotation, Speed)>>,
    }

    impl MotorDriver for Recorder {
        fn set_wheel(&self, side: Side, rotation: Rotation, speed: Speed) -> Result<(), MotorError> {
            self.calls.lock().unwrap().push((side, rotation, speed));
            Ok(())
        }
    }

    #[test]
    fn parse_direction_ignores_case() {
        assert_eq!("Forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!(" STOP ".parse::<Direction>().unwrap(), Direction::Stop);
        assert!(matches!(
            "jump".parse::<Direction>(),
            Err(MotorError::InvalidCommand(c)) if c == "jump"
        ));
    }

    #[test]
    fn speed_is_clamped() {
        assert_eq!(Speed::clamped(150.0).percent(), 100);
        assert_eq!(Speed::clamped(-5.0).percent(), 0);
        assert_eq!(Speed::clamped(42.6).percent(), 43);
        assert_eq!(Speed::clamped(f64::NAN), Speed::ZERO);
        assert_eq!(Speed::from(250).percent(), 100);
        assert_eq!(Speed::clamped(75.0).duty_cycle(), 0.75);
    }

    #[test]
    fn turns_counter_rotate_wheels() {
        assert_eq!(Direction::Left.wheels(), (Rotation::Backward, Rotation::Forward));
        assert_eq!(Direction::Right.wheels(), (Rotation::Forward, Rotation::Backward));
        assert_eq!(Rotation::Forward.input_levels(), (true, false));
        assert_eq!(Rotation::Backward.input_levels(), (false, true));
        assert_eq!(Rotation::Coast.input_levels(), (false, false));
    }

    #[test]
    fn drive_sets_both_wheels() {
        let driver = Recorder::default();
        driver.drive(Direction::Backward, Speed::from(60)).unwrap();
        let calls = driver.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (Side::Left, Rotation::Backward, Speed::from(60)),
                (Side::Right, Rotation::Backward, Speed::from(60)),
            ]
        );
    }

    #[test]
    fn stop_zeroes_speed() {
        let driver = Recorder::default();
        driver.drive(Direction::Stop, Speed::FULL).unwrap();
        driver.stop().unwrap();
        let calls = driver.calls.lock().unwrap();
        assert!(calls
            .iter()
            .all(|(_, rotation, speed)| *rotation == Rotation::Coast && *speed == Speed::ZERO));
        assert_eq!(calls.len(), 4);
    }
}
