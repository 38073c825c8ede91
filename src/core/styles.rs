//! Style roles expressed as an enum + macro mapping logical names to `colored::Color`.
//!
//! Coloring is applied only when the `enabled` flag passed to `paint()` is
//! true, so output written to pipes and files stays plain.
//!
//! ```
//! use relaybus::core::styles::StyleRole;
//! let plain = StyleRole::Header.paint("Title", false);
//! assert_eq!(plain, "Title");
//! let colored = StyleRole::Header.paint("Title", true);
//! assert!(colored.starts_with("\x1b["));
//! assert!(colored.ends_with("\x1b[0m"));
//! ```

use clap::builder::styling::AnsiColor;
use colored::Color;

macro_rules! style {
    ( $( $variant:ident => $color:expr ),+ $(,)? ) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum StyleRole { $( $variant ),+ }

        impl StyleRole {
            pub fn color(self) -> Option<Color> {
                match self { $( StyleRole::$variant => $color ),+ }
            }
        }
    }
}

style! {
    Header      => Some(Color::Yellow),
    Literal     => Some(Color::Cyan),
    Placeholder => Some(Color::Green),
    Key         => Some(Color::BrightGreen),
    Value       => None,
    Healthy     => Some(Color::Green),
    Degraded    => Some(Color::Yellow),
    Unhealthy   => Some(Color::Red),
    Suspect     => Some(Color::BrightRed),
    Dim         => Some(Color::BrightBlack)
}

impl StyleRole {
    pub fn ansi_code(self) -> Option<&'static str> {
        map_color_code(self.color()?)
    }

    pub fn paint(self, text: &str, enabled: bool) -> String {
        match self.ansi_code() {
            Some(code) if enabled => format!("\x1b[{}m{}\x1b[0m", code, text),
            _ => text.to_string(),
        }
    }

    /// Role for a process or health status label
    pub fn for_status(label: &str) -> StyleRole {
        match label {
            "running" | "healthy" => StyleRole::Healthy,
            "starting" | "stopping" | "degraded" => StyleRole::Degraded,
            "failed" | "unhealthy" => StyleRole::Unhealthy,
            "dead?" => StyleRole::Suspect,
            "stopped" => StyleRole::Dim,
            _ => StyleRole::Value,
        }
    }

    /// prettytable style spec (`Fy`, `Fr`, ...) for this role
    pub fn to_prettytable_spec(self) -> Option<&'static str> {
        Some(match self.color()? {
            Color::Red => "Fr",
            Color::Green => "Fg",
            Color::Yellow => "Fy",
            Color::Cyan => "Fc",
            Color::BrightRed => "FR",
            Color::BrightGreen => "FG",
            Color::BrightBlack => "FK",
            _ => return None,
        })
    }
}

fn map_color_code(c: Color) -> Option<&'static str> {
    use Color::*;
    Some(match c {
        Red => "31",
        Green => "32",
        Yellow => "33",
        Cyan => "36",
        BrightBlack => "90",
        BrightRed => "91",
        BrightGreen => "92",
        _ => return None,
    })
}

fn color_to_ansi(c: Color) -> Option<AnsiColor> {
    use self::AnsiColor as A;
    use Color::*;
    Some(match c {
        Red => A::Red,
        Green => A::Green,
        Yellow => A::Yellow,
        Cyan => A::Cyan,
        BrightBlack => A::BrightBlack,
        BrightRed => A::BrightRed,
        BrightGreen => A::BrightGreen,
        _ => return None,
    })
}

/// clap help styles built from the same roles
pub fn palette_to_clap(enabled: bool) -> clap::builder::Styles {
    use clap::builder::styling::{Color as ClapColor, Style};
    if !enabled {
        return clap::builder::Styles::plain();
    }

    let style = |role: StyleRole, bold: bool| {
        let mut s = Style::new();
        if let Some(col) = role.color().and_then(color_to_ansi) {
            s = s.fg_color(Some(ClapColor::Ansi(col)));
        }
        if bold {
            s = s.bold();
        }
        s
    };

    clap::builder::Styles::styled()
        .header(style(StyleRole::Header, true))
        .usage(style(StyleRole::Header, true))
        .literal(style(StyleRole::Literal, false))
        .placeholder(style(StyleRole::Placeholder, false))
        .valid(style(StyleRole::Healthy, false))
        .invalid(style(StyleRole::Unhealthy, false))
        .error(style(StyleRole::Suspect, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paint_enabled_disabled() {
        let colored = StyleRole::Header.paint("Hello", true);
        assert!(colored.starts_with("\x1b[33m") && colored.ends_with("\x1b[0m"));
        assert_eq!(StyleRole::Header.paint("Hello", false), "Hello");
        assert_eq!(StyleRole::Value.paint("Hello", true), "Hello");
    }

    #[test]
    fn status_roles() {
        assert_eq!(StyleRole::for_status("running"), StyleRole::Healthy);
        assert_eq!(StyleRole::for_status("dead?"), StyleRole::Suspect);
        assert_eq!(StyleRole::for_status("unhealthy"), StyleRole::Unhealthy);
        assert_eq!(StyleRole::for_status("whatever"), StyleRole::Value);
        assert_eq!(StyleRole::Suspect.to_prettytable_spec(), Some("FR"));
        assert_eq!(StyleRole::Value.to_prettytable_spec(), None);
    }

    #[test]
    fn clap_colors_follow_roles() {
        assert_eq!(color_to_ansi(Color::Yellow), Some(AnsiColor::Yellow));
        assert_eq!(color_to_ansi(Color::BrightRed), Some(AnsiColor::BrightRed));
        assert_eq!(color_to_ansi(Color::Magenta), None);
    }

    #[test]
    fn palette_to_clap_differs_when_enabled() {
        let plain_dbg = format!("{:?}", palette_to_clap(false));
        let styled_dbg = format!("{:?}", palette_to_clap(true));
        assert_ne!(plain_dbg, styled_dbg);
    }
}
