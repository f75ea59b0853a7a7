//! Synthetic sensor line generator
//!
//! Prints the same line grammar the doorway boards emit, one line per
//! period, so the service can run without hardware:
//!
//! - environment profiles emit `M:<0|1>;S:<dB>;C:<ppm>` with Bernoulli motion
//!   and Gaussian sound/CO2 clamped to the sensors' ranges
//! - `crossings` emits `A:<0|1>;B:<0|1>` beam patterns with random
//!   ENTER/EXIT directions
//!
//! Usage:
//!   sensor-sim --profile crowded
//!   sensor-sim --profile crossings --period-ms 200 --crossing-chance 0.1
//!
//! Or as a doorway source:
//!   source = { kind = "command", program = "sensor-sim", args = ["--profile", "average"] }

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};

const SOUND_RANGE: (f64, f64) = (30.0, 75.0);
const CO2_RANGE: (f64, f64) = (400.0, 1200.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    Overcrowded,
    Crowded,
    Average,
    Sparse,
    Empty,
    Crossings,
}

#[derive(Parser, Debug)]
#[command(name = "sensor-sim")]
#[command(about = "Emit synthetic doorway sensor lines on stdout")]
struct Args {
    /// Traffic profile
    #[arg(short, long, value_enum, default_value_t = Profile::Average)]
    profile: Profile,

    /// Delay between lines in milliseconds
    #[arg(long, default_value = "1000")]
    period_ms: u64,

    /// Number of lines to emit (0 = run forever)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Chance that an idle period starts a crossing (crossings profile)
    #[arg(long, default_value = "0.2")]
    crossing_chance: f64,

    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,
}

/// Distribution parameters for one environment profile
#[derive(Debug, Clone, Copy)]
struct EnvProfile {
    motion_chance: f64,
    /// (mean when still, mean when moving, std dev)
    sound: (f64, f64, f64),
    co2: (f64, f64, f64),
}

impl EnvProfile {
    fn for_profile(profile: Profile) -> Option<Self> {
        let p = match profile {
            Profile::Overcrowded => EnvProfile {
                motion_chance: 0.9,
                sound: (65.0, 65.0, 4.0),
                co2: (1100.0, 1100.0, 40.0),
            },
            Profile::Crowded => EnvProfile {
                motion_chance: 0.7,
                sound: (58.0, 58.0, 4.0),
                co2: (950.0, 950.0, 40.0),
            },
            Profile::Average => EnvProfile {
                motion_chance: 0.4,
                sound: (45.0, 55.0, 4.0),
                co2: (700.0, 850.0, 40.0),
            },
            Profile::Sparse => EnvProfile {
                motion_chance: 0.15,
                sound: (36.0, 36.0, 3.0),
                co2: (480.0, 480.0, 20.0),
            },
            Profile::Empty => EnvProfile {
                motion_chance: 0.1,
                sound: (32.0, 32.0, 2.0),
                co2: (420.0, 420.0, 10.0),
            },
            Profile::Crossings => return None,
        };
        Some(p)
    }
}

/// Standard normal sample (Box-Muller)
fn gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn environment_line<R: Rng>(rng: &mut R, profile: &EnvProfile) -> String {
    let moving = rng.gen_bool(profile.motion_chance);
    let pick = |(still, active, _): (f64, f64, f64)| if moving { active } else { still };

    let sound = round1(gaussian(rng, pick(profile.sound), profile.sound.2))
        .clamp(SOUND_RANGE.0, SOUND_RANGE.1);
    let co2 =
        round1(gaussian(rng, pick(profile.co2), profile.co2.2)).clamp(CO2_RANGE.0, CO2_RANGE.1);

    format!("M:{};S:{sound:.1};C:{co2:.1}", u8::from(moving))
}

/// Emits beam patterns; each crossing spans three periods
struct CrossingGenerator {
    pending: VecDeque<&'static str>,
    chance: f64,
}

impl CrossingGenerator {
    fn new(chance: f64) -> Self {
        Self { pending: VecDeque::new(), chance: chance.clamp(0.0, 1.0) }
    }

    fn next_line<R: Rng>(&mut self, rng: &mut R) -> &'static str {
        if let Some(line) = self.pending.pop_front() {
            return line;
        }
        if rng.gen_bool(self.chance) {
            let pattern: [&'static str; 3] = if rng.gen_bool(0.5) {
                // Outer beam first: ENTER
                ["A:1;B:0", "A:0;B:1", "A:0;B:0"]
            } else {
                // Inner beam first: EXIT
                ["A:0;B:1", "A:1;B:0", "A:0;B:0"]
            };
            self.pending.extend(&pattern[1..]);
            return pattern[0];
        }
        "A:0;B:0"
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let env_profile = EnvProfile::for_profile(args.profile);
    let mut crossings = CrossingGenerator::new(args.crossing_chance);
    let period = Duration::from_millis(args.period_ms);
    let mut out = BufWriter::new(tokio::io::stdout());

    let mut emitted = 0u64;
    while args.count == 0 || emitted < args.count {
        let line = match &env_profile {
            Some(profile) => environment_line(&mut rng, profile),
            None => crossings.next_line(&mut rng).to_string(),
        };

        // A closed pipe means the reader is gone
        if out.write_all(format!("{line}\n").as_bytes()).await.is_err() || out.flush().await.is_err()
        {
            break;
        }
        emitted += 1;

        if !period.is_zero() {
            tokio::time::sleep(period).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorway_occupancy::domain::{parse_line, Reading};

    #[test]
    fn test_environment_lines_parse_within_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for profile in [
            Profile::Overcrowded,
            Profile::Crowded,
            Profile::Average,
            Profile::Sparse,
            Profile::Empty,
        ] {
            let env = EnvProfile::for_profile(profile).unwrap();
            for _ in 0..200 {
                let line = environment_line(&mut rng, &env);
                let Ok(Reading::Environment(sample)) = parse_line(&line, 0) else {
                    panic!("unexpected line {line}");
                };
                assert!((SOUND_RANGE.0..=SOUND_RANGE.1).contains(&sample.sound_level_db));
                assert!((CO2_RANGE.0..=CO2_RANGE.1).contains(&sample.co2_ppm));
            }
        }
    }

    #[test]
    fn test_overcrowded_moves_more_than_empty() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut active = |profile| {
            let env = EnvProfile::for_profile(profile).unwrap();
            (0..500).filter(|_| environment_line(&mut rng, &env).starts_with("M:1")).count()
        };
        assert!(active(Profile::Overcrowded) > active(Profile::Empty));
    }

    #[test]
    fn test_crossing_patterns_complete() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut generator = CrossingGenerator::new(1.0);
        let first = generator.next_line(&mut rng);
        assert_ne!(first, "A:0;B:0");
        let second = generator.next_line(&mut rng);
        assert_ne!(first, second);
        assert_eq!(generator.next_line(&mut rng), "A:0;B:0");
    }

    #[test]
    fn test_zero_chance_is_idle() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut generator = CrossingGenerator::new(0.0);
        assert!((0..50).all(|_| generator.next_line(&mut rng) == "A:0;B:0"));
    }
}
