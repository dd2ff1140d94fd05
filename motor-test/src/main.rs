//! Interactive L298N wiring check. Spins each wheel in turn, then both,
//! then sweeps a few speeds, and finishes with a multimeter guide.

use std::path::PathBuf;
use std::time::Duration;

use pi_rover_common::config::{Config, MotorConfig};
use pi_rover_common::motor::{GpioMotorDriver, MotorDriver, MotorError, Rotation, Side, Speed};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const RUN_TIME: Duration = Duration::from_secs(2);
const PAUSE: Duration = Duration::from_secs(1);

/// One timed run of the chassis.
#[derive(Debug, Clone, PartialEq)]
struct Step {
    label: String,
    left: (Rotation, Speed),
    right: (Rotation, Speed),
}

impl Step {
    fn single(label: &str, side: Side, rotation: Rotation) -> Self {
        let driven = (rotation, Speed::FULL);
        let idle = (Rotation::Coast, Speed::ZERO);
        let (left, right) = match side {
            Side::Left => (driven, idle),
            Side::Right => (idle, driven),
        };
        Self {
            label: label.to_string(),
            left,
            right,
        }
    }

    fn both_forward(speed: Speed) -> Self {
        Self {
            label: format!("both motors forward at {speed}"),
            left: (Rotation::Forward, speed),
            right: (Rotation::Forward, speed),
        }
    }
}

fn test_plan() -> Vec<Step> {
    let mut steps = vec![
        Step::single("left motor forward", Side::Left, Rotation::Forward),
        Step::single("left motor backward", Side::Left, Rotation::Backward),
        Step::single("right motor forward", Side::Right, Rotation::Forward),
        Step::single("right motor backward", Side::Right, Rotation::Backward),
        Step::both_forward(Speed::FULL),
    ];
    steps.extend([50, 75, 100].map(|p| Step::both_forward(Speed::from(p))));
    steps
}

fn log_pins(step: &Step, pins: &MotorConfig) {
    let (l_a, l_b) = step.left.0.input_levels();
    let (r_a, r_b) = step.right.0.input_levels();
    info!(
        in1 = pins.left_in1,
        in1_high = l_a,
        in2 = pins.left_in2,
        in2_high = l_b,
        en = pins.left_en,
        duty = %step.left.1,
        "left motor pins"
    );
    info!(
        in3 = pins.right_in3,
        in3_high = r_a,
        in4 = pins.right_in4,
        in4_high = r_b,
        en = pins.right_en,
        duty = %step.right.1,
        "right motor pins"
    );
}

async fn run_plan(
    driver: &dyn MotorDriver,
    steps: &[Step],
    pins: &MotorConfig,
    run_time: Duration,
    pause: Duration,
) -> Result<(), MotorError> {
    for step in steps {
        info!("testing {}", step.label);
        log_pins(step, pins);
        driver.set_wheel(Side::Left, step.left.0, step.left.1)?;
        driver.set_wheel(Side::Right, step.right.0, step.right.1)?;
        tokio::time::sleep(run_time).await;
        driver.stop()?;
        tokio::time::sleep(pause).await;
    }
    Ok(())
}

fn print_voltage_guide(pins: &MotorConfig) {
    println!("\n{}", "=".repeat(60));
    println!("VOLTAGE CHECK GUIDE");
    println!("{}", "=".repeat(60));
    println!("\nWith a multimeter, measure these voltages:");
    println!("\n1. GPIO {} to GND:", pins.left_en);
    println!("   Should be ~3.3V when the motor is running");
    println!("\n2. L298N 12V terminal to GND:");
    println!("   Should be 6-12V (motor power supply)");
    println!("\n3. L298N 5V terminal to GND:");
    println!("   Should be ~5V (from the Pi or the L298N regulator)");
    println!("\n4. Between OUT1 and OUT2 (left motor):");
    println!("   Should be ~motor voltage when running");
    println!("\n5. Between OUT3 and OUT4 (right motor):");
    println!("   Should be ~motor voltage when running");
    println!("\nIf no motor moved:");
    println!("  - check the power supply on the L298N 12V terminal");
    println!("  - check the motor leads on OUT1-OUT4");
    println!("  - check the GPIO wiring matches the [motors] config");
    println!("  - remove the ENA/ENB jumpers so the enable pins are driven by PWM");
    println!("If only some motors moved:");
    println!("  - check the wiring of the silent motor");
    println!("  - test that motor directly with a battery");
}

async fn wait_for_enter() -> std::io::Result<()> {
    println!("SAFETY CHECKS:");
    println!("  1. Wheels are off the ground (chassis on a stand)");
    println!("  2. Motor power supply is connected (6-12V to the L298N)");
    println!("  3. All wires are secure");
    println!("  4. Hands are clear of moving parts");
    println!("\nPress ENTER to continue or Ctrl+C to cancel...");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // The diagnostic also runs without a config file, using the default wiring.
    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {e}", config_path.display());
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    tokio::select! {
        res = wait_for_enter() => {
            if let Err(e) = res {
                error!(error = %e, "failed to read from stdin");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("cancelled");
            return;
        }
    }

    let driver = match GpioMotorDriver::open(&config.motors) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "GPIO initialization failed");
            std::process::exit(1);
        }
    };

    let steps = test_plan();
    tokio::select! {
        res = run_plan(&driver, &steps, &config.motors, RUN_TIME, PAUSE) => match res {
            Ok(()) => {
                info!("diagnostic test complete");
                print_voltage_guide(&config.motors);
            }
            Err(e) => error!(error = %e, "motor test failed"),
        },
        _ = tokio::signal::ctrl_c() => warn!("test interrupted"),
    }

    if let Err(e) = driver.stop() {
        error!(error = %e, "failed to stop motors");
    }
    drop(driver);
    info!("GPIO cleanup complete");
}
