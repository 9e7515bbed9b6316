use anyhow::Result;
use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::browser::session::BrowserDriver;
use crate::cli::config::BrowserBehavior;

/// Human-like behavior simulator for browser automation
pub struct BehaviorSimulator {
    /// Configuration for behavior simulation
    config: BrowserBehavior,
}

impl BehaviorSimulator {
    /// Create a new behavior simulator with the given configuration
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Simulate human-like scrolling
    pub async fn scroll(&self, driver: &dyn BrowserDriver, distance: Option<i32>) -> Result<()> {
        let (distance, scroll_behavior) = {
            let mut rng = thread_rng();

            // Random scroll distance between 100 and 800 pixels
            let distance = distance.unwrap_or_else(|| rng.gen_range(100..800));

            let scroll_behavior = match self.config.scroll_behavior.as_str() {
                "smooth" => "smooth",
                "random" => if rng.gen_bool(0.7) { "smooth" } else { "auto" },
                _ => "auto",
            };

            (distance, scroll_behavior)
        };

        let direction = distance.signum();
        let total = distance.abs();

        // Execute scroll in chunks with random pauses
        let mut scrolled = 0;
        while scrolled < total {
            let (chunk, pause_ms) = {
                let mut rng = thread_rng();
                (rng.gen_range(100..300).min(total - scrolled), self.pause_ms(&mut rng))
            };
            scrolled += chunk;

            let script = format!(
                "window.scrollBy({{ top: {}, left: 0, behavior: '{}' }});",
                chunk * direction,
                scroll_behavior
            );
            driver.execute(&script).await?;

            sleep(Duration::from_millis(pause_ms)).await;
        }

        debug!("Scrolled {} pixels", distance);

        Ok(())
    }

    /// Dispatch a synthetic mouse movement to a random point in the viewport
    pub async fn move_mouse(&self, driver: &dyn BrowserDriver) -> Result<()> {
        let (x, y) = {
            let mut rng = thread_rng();
            (rng.gen_range(0.1..0.9), rng.gen_range(0.1..0.9))
        };

        let script = format!(
            "document.dispatchEvent(new MouseEvent('mousemove', {{ clientX: Math.floor(window.innerWidth * {x:.3}), clientY: Math.floor(window.innerHeight * {y:.3}), bubbles: true }}));",
            x = x,
            y = y
        );
        driver.execute(&script).await?;

        Ok(())
    }

    /// Simulate random pauses during browsing
    pub async fn random_pause(&self) -> Result<()> {
        let pause_ms = self.pause_ms(&mut thread_rng());

        sleep(Duration::from_millis(pause_ms)).await;
        debug!("Paused for {} ms", pause_ms);

        Ok(())
    }

    /// A short stretch of presence on a freshly loaded page
    pub async fn simulate_presence(&self, driver: &dyn BrowserDriver) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let steps = {
            let (low, high) = self.config.scroll_steps;
            thread_rng().gen_range(low..=high.max(low))
        };

        for _ in 0..steps {
            if self.config.mouse_movement {
                self.move_mouse(driver).await?;
            }
            if self.config.scroll_behavior != "none" {
                self.scroll(driver, None).await?;
            } else {
                self.random_pause().await?;
            }
        }

        debug!("Simulated presence over {} steps", steps);

        Ok(())
    }

    fn pause_ms<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let (low, high) = self.config.pause_ms;
        rng.gen_range(low..=high.max(low))
    }
}
