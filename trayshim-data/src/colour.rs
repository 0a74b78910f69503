use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Colour {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Colour {
    pub const BLACK: Self = Self::opaque(0, 0, 0);
    pub const WHITE: Self = Self::opaque(255, 255, 255);

    #[must_use]
    pub const fn opaque(red: u8, green: u8, blue: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha: 255,
        }
    }

    /// Serialises `self` as an u32 where each byte represents a component of `Colour`.
    #[must_use]
    pub const fn serialise_to_u32(self) -> u32 {
        let Colour {
            red,
            green,
            blue,
            alpha,
        } = self;

        ((red as u32) << 24) | ((green as u32) << 16) | ((blue as u32) << 8) | (alpha as u32)
    }

    /// Creates a [`Self`] from a `u32` whose byte layout is assumed to be `RGBA`.
    ///
    /// [`Self::serialise_to_u32`] will create a `u32` in this layout, and you should use this
    /// function paired with that one.
    #[must_use]
    pub const fn deserialise_from_u32(raw: u32) -> Self {
        let red = (raw >> 24) as u8;
        let green = ((raw >> 16) & 0xFF) as u8;
        let blue = ((raw >> 8) & 0xFF) as u8;
        let alpha = (raw & 0xFF) as u8;

        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// The colour as cairo-style `(r, g, b)` components in the `0.0..=1.0` range
    #[must_use]
    pub fn to_cairo_rgb(self) -> (f64, f64, f64) {
        (
            f64::from(self.red) / 255.0,
            f64::from(self.green) / 255.0,
            f64::from(self.blue) / 255.0,
        )
    }

    /// Blends a straight-alpha `source` pixel over `self`, ignoring `self`'s alpha.
    #[must_use]
    pub fn blend_under(self, source: Colour) -> Colour {
        let a = u32::from(source.alpha);
        let blend = |src: u8, dst: u8| {
            ((u32::from(src) * a + u32::from(dst) * (255 - a) + 255 / 2) / 255) as u8
        };

        Colour::opaque(
            blend(source.red, self.red),
            blend(source.green, self.green),
            blend(source.blue, self.blue),
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not a colour of the form #rrggbb or #rrggbbaa")]
pub struct InvalidColour(pub String);

impl FromStr for Colour {
    type Err = InvalidColour;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidColour(s.to_owned());

        let hex = s.trim().strip_prefix('#').ok_or_else(invalid)?;
        if !hex.is_ascii() {
            return Err(invalid());
        }
        let component = |idx: usize| u8::from_str_radix(&hex[idx..idx + 2], 16).map_err(|_| invalid());

        match hex.len() {
            6 => Ok(Colour::opaque(component(0)?, component(2)?, component(4)?)),
            8 => Ok(Colour {
                red: component(0)?,
                green: component(2)?,
                blue: component(4)?,
                alpha: component(6)?,
            }),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex() {
        assert_eq!("#3c3c3c".parse(), Ok(Colour::opaque(0x3c, 0x3c, 0x3c)));
        assert_eq!(
            "#ff000080".parse(),
            Ok(Colour {
                red: 255,
                green: 0,
                blue: 0,
                alpha: 0x80
            })
        );
        assert!("3c3c3c".parse::<Colour>().is_err());
        assert!("#3c3c".parse::<Colour>().is_err());
        assert!("#zzzzzz".parse::<Colour>().is_err());
        assert!("#ééé".parse::<Colour>().is_err());
    }

    #[test]
    fn u32_layout() {
        let colour = Colour {
            red: 1,
            green: 2,
            blue: 3,
            alpha: 4,
        };
        assert_eq!(colour.serialise_to_u32(), 0x0102_0304);
        assert_eq!(Colour::deserialise_from_u32(0x0102_0304), colour);
    }

    #[test]
    fn blending() {
        let background = Colour::opaque(0, 0, 0);

        assert_eq!(background.blend_under(Colour::WHITE), Colour::WHITE);
        assert_eq!(
            background.blend_under(Colour {
                alpha: 0,
                ..Colour::WHITE
            }),
            background
        );
        assert_eq!(
            background.blend_under(Colour {
                alpha: 128,
                ..Colour::WHITE
            }),
            Colour::opaque(128, 128, 128)
        );
    }
}
