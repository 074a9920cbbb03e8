use std::path::{Path, PathBuf};

macro_rules! tomlget_or {
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.$conv())
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to find {}:{} in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to convert {}:{} to {}; proceeding with default {:?}",
                    $sec,
                    $key,
                    stringify!($as),
                    $or
                );
                $or
            }) as $as
    };
    ($cfg:ident, $sec:expr, $key:expr, as_str, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.as_str())
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to get {}:{} in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to convert {}:{} to string; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                $or
            })
    };
    ($cfg:ident, $sec:expr, $key:expr, as_bool, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.as_bool())
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to get {}:{} in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                tracing::warn!(
                    "failed to convert {}:{} to bool; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                $or
            })
    };
}

macro_rules! tomlget_opt {
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.$conv())
            .map(|val| val as $as)
    };
    ($cfg:ident, $sec:expr, $key:expr, as_str) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.as_str())
    };
}

macro_rules! tomlget {
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty) => {
        $cfg.get($sec)
            .ok_or_else(|| format!("failed to get section {}", $sec))?
            .get($key)
            .ok_or_else(|| format!("failed to get key {}:{}", $sec, $key))?
            .$conv()
            .ok_or_else(|| format!("failed to convert {}:{} to {}", $sec, $key, stringify!($as)))?
            as $as
    };
    ($cfg:ident, $sec:expr, $key:expr, as_str) => {
        $cfg.get($sec)
            .ok_or_else(|| format!("failed to get section {}", $sec))?
            .get($key)
            .ok_or_else(|| format!("failed to get key {}:{}", $sec, $key))?
            .as_str()
            .ok_or_else(|| format!("failed to convert {}:{} to string", $sec, $key))?
    };
    ($cfg:ident, $sec:expr, $key:expr, as_array) => {
        $cfg.get($sec)
            .ok_or_else(|| format!("failed to get section {}", $sec))?
            .get($key)
            .ok_or_else(|| format!("failed to get key {}:{}", $sec, $key))?
            .as_array()
            .ok_or_else(|| format!("failed to convert {}:{} to array", $sec, $key))?
    };
}

/// Look for `file_name` in the working directory, then next to the executable.
#[must_use]
pub fn find_file(file_name: &Path) -> Option<PathBuf> {
    if file_name.is_absolute() {
        return file_name.exists().then(|| file_name.into());
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.join(file_name).exists() {
            return Some(cwd.join(file_name));
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if exe.parent()?.join(file_name).exists() {
            return Some(exe.parent()?.join(file_name));
        }
    }
    None
}

pub(crate) use {tomlget, tomlget_opt, tomlget_or};

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(cfg: &toml::Value) -> Result<(f64, i32, String, bool), String> {
        let threshold = tomlget!(cfg, "amdor", "threshold", as_float, f64);
        let shift = tomlget_or!(cfg, "tuner", "kick_ticks", as_integer, i32, 50);
        let name = tomlget_or!(cfg, "general", "spectrometer", as_str, "ftm1").to_string();
        let missing = tomlget_opt!(cfg, "tuner", "cal_search_center_ticks", as_integer, i32);
        Ok((threshold, shift, name, missing.is_some()))
    }

    #[test]
    fn macros_fall_back_to_defaults() {
        let cfg: toml::Value =
            toml::from_str("[amdor]\nthreshold = 0.25\n[tuner]\nkick_ticks = \"x\"\n").unwrap();
        assert_eq!(lookup(&cfg), Ok((0.25, 50, "ftm1".to_string(), false)));
    }

    #[test]
    fn required_key_is_an_error() {
        let cfg: toml::Value = toml::from_str("[general]\nspectrometer = \"ftm2\"\n").unwrap();
        assert_eq!(lookup(&cfg), Err("failed to get section amdor".to_string()));
    }

    #[test]
    fn absolute_paths_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(find_file(&path), None);
        std::fs::write(&path, "").unwrap();
        assert_eq!(find_file(&path), Some(path));
    }
}
