//! Device paths on the emulated machine: `/<drive>/<path>`

use regex::Regex;
use std::sync::OnceLock;
use xboxtest_common::{Error, Result};

const FILE_PATH: &str = r"^/[CDEFGXYZ]/.*[^/]$";
const DIRECTORY_PATH: &str = r"^/[CDEFGXYZ]/($|(.+/$))";

static FILE_PATH_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DIRECTORY_PATH_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn matches(cell: &OnceLock<Option<Regex>>, pattern: &str, path: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(path))
}

/// A file path, e.g. `/C/test/file.txt`
pub fn is_file_path(path: &str) -> bool {
    matches(&FILE_PATH_RE, FILE_PATH, path)
}

/// A directory path with a trailing slash, e.g. `/C/test/` or `/E/`
pub fn is_directory_path(path: &str) -> bool {
    matches(&DIRECTORY_PATH_RE, DIRECTORY_PATH, path)
}

pub fn validate_file_path(path: &str) -> Result<()> {
    if is_file_path(path) {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!(
            "{:?} must be of the form /<drive>/<path>, e.g. /C/test/file.txt",
            path
        )))
    }
}

pub fn validate_directory_path(path: &str) -> Result<()> {
    if is_directory_path(path) {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!(
            "{:?} must be of the form /<drive>/<path>/, e.g. /C/test/",
            path
        )))
    }
}

/// Drive letter of a validated path
pub fn drive_of(path: &str) -> Option<char> {
    path.strip_prefix('/')?.chars().next()
}

pub fn same_drive(a: &str, b: &str) -> bool {
    drive_of(a).is_some() && drive_of(a) == drive_of(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_paths() {
        for ok in ["/C/file.txt", "/E/UDATA/save game.dat", "/Z/a"] {
            assert!(is_file_path(ok), "{}", ok);
        }
        for bad in ["/C/", "/C/dir/", "C/file.txt", "/A/file.txt", "/c/file.txt", "/C", ""] {
            assert!(!is_file_path(bad), "{}", bad);
            assert!(matches!(validate_file_path(bad), Err(Error::InvalidPath(_))));
        }
    }

    #[test]
    fn test_directory_paths() {
        for ok in ["/C/", "/E/UDATA/", "/F/a b/c/"] {
            assert!(is_directory_path(ok), "{}", ok);
        }
        for bad in ["/C", "/C/dir", "/Q/dir/", "E/UDATA/", "/"] {
            assert!(!is_directory_path(bad), "{}", bad);
            assert!(validate_directory_path(bad).is_err());
        }
    }

    #[test]
    fn test_drives() {
        assert_eq!(drive_of("/E/UDATA/"), Some('E'));
        assert!(same_drive("/C/a.txt", "/C/dir/b.txt"));
        assert!(!same_drive("/C/a.txt", "/E/a.txt"));
    }
}
