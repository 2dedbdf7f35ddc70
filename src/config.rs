use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::{info, warn};
use serde::Deserialize;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::velocity::{
    AccelerateFriction, Exponential, MAX_MAX_VELOCITY, MIN_MAX_VELOCITY, VelocitySmoother,
    clamp_max_velocity,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrollSettings {
    /// Pixels per frame at full downward speed.
    pub down_speed: f32,
    pub up_speed: f32,
    pub max_velocity: f32,
    /// Dead zone in velocity units: `|v|` at or below this scrolls nothing.
    pub velocity_threshold: f32,
    pub detection_interval_ms: u64,
    pub frame_interval_ms: u64,
    pub stability_threshold: u32,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            down_speed: 15.0,
            up_speed: 15.0,
            max_velocity: 5.0,
            velocity_threshold: 0.5,
            detection_interval_ms: 30,
            frame_interval_ms: 16,
            stability_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmoothingMode {
    Exponential,
    AccelerateFriction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Smoothing {
    pub mode: SmoothingMode,
    pub factor: f32,
    pub acceleration: f32,
    pub friction: f32,
}

impl Default for Smoothing {
    fn default() -> Self {
        Self {
            mode: SmoothingMode::AccelerateFriction,
            factor: 0.15,
            acceleration: 0.5,
            friction: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PalmThresholds {
    pub min_extension: f32,
    pub min_spread: f32,
}

impl Default for PalmThresholds {
    fn default() -> Self {
        Self {
            min_extension: 0.1,
            min_spread: 0.08,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub command: String,
    pub args: Vec<String>,
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub facing: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            command: "palmscroll-landmarks".to_string(),
            args: Vec::new(),
            device: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 720,
            facing: "user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkKind {
    Uinput,
    DryRun,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub kind: SinkKind,
    pub pixels_per_notch: f32,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            kind: SinkKind::Uinput,
            pixels_per_notch: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub meta: Meta,
    #[serde(default)]
    pub scroll: ScrollSettings,
    #[serde(default)]
    pub smoothing: Smoothing,
    #[serde(default)]
    pub palm: PalmThresholds,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub sink: SinkSettings,
}

impl Profile {
    pub fn parse(txt: &str) -> Result<Self> {
        let mut profile: Profile = toml::from_str(txt)?;
        validate_profile(&profile)?;
        let clamped = clamp_max_velocity(profile.scroll.max_velocity);
        if clamped != profile.scroll.max_velocity {
            warn!(
                "scroll.max_velocity {} outside [{MIN_MAX_VELOCITY}, {MAX_MAX_VELOCITY}], using {clamped}",
                profile.scroll.max_velocity
            );
            profile.scroll.max_velocity = clamped;
        }
        Ok(profile)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.scroll.detection_interval_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.scroll.frame_interval_ms)
    }

    /// Build the smoother selected by `smoothing.mode`.
    pub fn smoother(&self) -> Box<dyn VelocitySmoother> {
        match self.smoothing.mode {
            SmoothingMode::Exponential => Box::new(Exponential {
                factor: self.smoothing.factor,
                velocity_threshold: self.scroll.velocity_threshold,
            }),
            SmoothingMode::AccelerateFriction => Box::new(AccelerateFriction {
                acceleration: self.smoothing.acceleration,
                friction: self.smoothing.friction,
            }),
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            meta: Meta {
                name: Some("default".to_string()),
            },
            scroll: ScrollSettings::default(),
            smoothing: Smoothing::default(),
            palm: PalmThresholds::default(),
            source: SourceSettings::default(),
            sink: SinkSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(dirs.home_dir().join(".config").join("palmscroll"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        Self::load_from(config_dir()?)
    }

    pub fn load_from(cfgdir: PathBuf) -> Result<Self> {
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = load_profile(&profdir, &active_name)?;

        Ok(Self {
            active_name,
            profile,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    pub fn active_path(&self) -> PathBuf {
        self.profiles_dir.join(format!("{}.toml", self.active_name))
    }

    /// Re-read the active profile. On error the previous profile stays.
    pub fn reload(&mut self) -> Result<()> {
        self.profile = read_profile(&self.active_path())?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let profile = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    /// Load another profile without making it active.
    pub fn profile_named(&self, name: &str) -> Result<Profile> {
        load_profile(&self.profiles_dir, name)
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let uinput_ok = Path::new("/dev/uinput").exists();
        let in_input_group = check_in_input_group();
        let helper = &self.profile.source.command;
        serde_json::json!({
            "uinput_present": uinput_ok,
            "input_group_member": in_input_group,
            "video_devices": detect_video_devices(),
            "configured_device": self.profile.source.device,
            "helper_command": helper,
            "helper_found": find_on_path(helper).is_some(),
            "config_dir": self.config_dir,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input",
                "add_user_to_video_group": "sudo usermod -aG video $USER"
            }
        })
    }
}

fn load_profile(profiles_dir: &Path, name: &str) -> Result<Profile> {
    read_profile(&profiles_dir.join(format!("{name}.toml")))
}

fn read_profile(path: &Path) -> Result<Profile> {
    let txt = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    Profile::parse(&txt).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))
}

fn validate_profile(p: &Profile) -> Result<()> {
    let s = &p.scroll;
    if s.detection_interval_ms == 0 || s.frame_interval_ms == 0 {
        return Err(anyhow!("scroll intervals must be positive durations"));
    }
    if s.stability_threshold == 0 {
        return Err(anyhow!("scroll.stability_threshold must be at least 1"));
    }
    if s.down_speed <= 0.0 || s.up_speed <= 0.0 {
        return Err(anyhow!("scroll speeds must be positive"));
    }
    if s.velocity_threshold < 0.0 {
        return Err(anyhow!("scroll.velocity_threshold must not be negative"));
    }

    let m = &p.smoothing;
    if !(m.factor > 0.0 && m.factor <= 1.0) {
        return Err(anyhow!("smoothing.factor must be in (0,1]"));
    }
    if !(m.friction > 0.0 && m.friction < 1.0) {
        return Err(anyhow!("smoothing.friction must be in (0,1)"));
    }
    if m.acceleration <= 0.0 {
        return Err(anyhow!("smoothing.acceleration must be positive"));
    }

    if p.palm.min_extension < 0.0 || p.palm.min_spread < 0.0 {
        return Err(anyhow!("palm thresholds must not be negative"));
    }
    if p.source.command.trim().is_empty() {
        return Err(anyhow!("source.command must not be empty"));
    }
    if p.sink.pixels_per_notch <= 0.0 {
        return Err(anyhow!("sink.pixels_per_notch must be positive"));
    }
    Ok(())
}

fn detect_video_devices() -> Vec<String> {
    let mut out = vec![];
    if let Ok(rd) = fs::read_dir("/dev") {
        for e in rd.flatten() {
            let p = e.path();
            if p.file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with("video"))
            {
                out.push(p.display().to_string());
            }
        }
    }
    out.sort();
    out
}

pub fn find_on_path(cmd: &str) -> Option<PathBuf> {
    let p = Path::new(cmd);
    if p.components().count() > 1 {
        return p.is_file().then(|| p.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(cmd))
        .find(|candidate| candidate.is_file())
}

fn check_in_input_group() -> bool {
    if let Ok(s) = fs::read_to_string("/etc/group") {
        let user = whoami::username();
        for line in s.lines() {
            if line.starts_with("input:") {
                if line
                    .split(':')
                    .nth(3)
                    .unwrap_or("")
                    .split(',')
                    .any(|u| u == user)
                {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bundled_default_profile_parses() {
        let p = Profile::parse(default_profile_text()).unwrap();
        assert_eq!(p.meta.name.as_deref(), Some("default"));
        assert_eq!(p.scroll.detection_interval_ms, 30);
        assert_eq!(p.scroll.stability_threshold, 3);
        assert_eq!(p.smoothing.mode, SmoothingMode::AccelerateFriction);
        assert_eq!(p.sink.kind, SinkKind::Uinput);
    }

    #[test]
    fn missing_sections_take_defaults() {
        let p = Profile::parse("[meta]\nname = \"bare\"\n").unwrap();
        assert_eq!(p.scroll.frame_interval_ms, 16);
        assert_eq!(p.palm.min_spread, 0.08);
        assert_eq!(p.source.width, 1280);
        assert_eq!(p.smoother().name(), "accelerate-friction");
    }

    #[test]
    fn exponential_mode_is_selectable() {
        let p = Profile::parse(
            "[meta]\nname = \"smooth\"\n[smoothing]\nmode = \"exponential\"\nfactor = 0.3\n",
        )
        .unwrap();
        assert_eq!(p.smoother().name(), "exponential");
    }

    #[test]
    fn out_of_range_max_velocity_is_clamped() {
        let p = Profile::parse("[meta]\nname = \"fast\"\n[scroll]\nmax_velocity = 25.0\n").unwrap();
        assert_eq!(p.scroll.max_velocity, 10.0);
        let p = Profile::parse("[meta]\nname = \"slow\"\n[scroll]\nmax_velocity = 0.1\n").unwrap();
        assert_eq!(p.scroll.max_velocity, 1.0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[scroll]\ndetection_interval_ms = 0\n",
            "[scroll]\nstability_threshold = 0\n",
            "[scroll]\ndown_speed = -1.0\n",
            "[smoothing]\nfactor = 1.5\n",
            "[smoothing]\nfriction = 1.0\n",
            "[sink]\npixels_per_notch = 0.0\n",
            "[source]\ncommand = \"  \"\n",
        ];
        for body in cases {
            let txt = format!("[meta]\nname = \"bad\"\n{body}");
            assert!(Profile::parse(&txt).is_err(), "accepted: {body}");
        }
    }

    #[test]
    fn installs_default_and_switches_profiles() {
        let dir = tempdir().unwrap();
        let mut st = DaemonConfigState::load_from(dir.path().to_path_buf()).unwrap();
        assert_eq!(st.active_name, "default");
        assert!(st.active_path().exists());

        fs::write(
            st.profiles_dir.join("calm.toml"),
            "[meta]\nname = \"calm\"\n[scroll]\nmax_velocity = 2.0\n",
        )
        .unwrap();
        assert_eq!(st.list_profiles(), vec!["calm", "default"]);

        st.set_active("calm").unwrap();
        assert_eq!(st.profile.scroll.max_velocity, 2.0);
        assert_eq!(fs::read_to_string(&st.active_ptr).unwrap(), "calm");
        assert!(st.set_active("missing").is_err());
        assert_eq!(st.profile_named("default").unwrap().scroll.max_velocity, 5.0);
        assert_eq!(st.active_name, "calm");
    }

    #[test]
    fn failed_reload_keeps_last_good_profile() {
        let dir = tempdir().unwrap();
        let mut st = DaemonConfigState::load_from(dir.path().to_path_buf()).unwrap();
        fs::write(st.active_path(), "[meta]\nname = \"default\"\n[smoothing]\nfriction = 4.0\n")
            .unwrap();
        assert!(st.reload().is_err());
        assert_eq!(st.profile.smoothing.friction, 0.9);
    }
}
