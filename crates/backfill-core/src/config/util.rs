use std::path::{Component, Path};

/// Replace a leading `~` component with the home directory. `~user` forms
/// and paths without a home directory are returned unchanged.
pub fn expand_tilde(path: &str) -> String {
    let p = Path::new(path);
    let mut components = p.components();
    match (components.next(), dirs::home_dir()) {
        (Some(Component::Normal(first)), Some(home)) if first == "~" => {
            let rest = components.as_path();
            let full = if rest.as_os_str().is_empty() { home } else { home.join(rest) };
            full.to_string_lossy().into_owned()
        }
        _ => path.to_string(),
    }
}
