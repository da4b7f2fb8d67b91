use crate::types::Mode;

/// Groups of modes that some firmware revisions cannot switch between directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFamily {
    Off,
    Heat,
    Cool,
    Dry,
}

impl ModeFamily {
    pub fn of(mode: Mode) -> Self {
        match mode {
            Mode::Off => Self::Off,
            Mode::Heat | Mode::Turbo | Mode::ExtHeat => Self::Heat,
            Mode::Cool => Self::Cool,
            Mode::Dry => Self::Dry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Direct,
    OffFirst,
}

/// Decides whether `target` must be preceded by an OFF press.
///
/// `current` is `None` when no fresh, valid status frame is available; in that case every
/// non-OFF target goes through OFF.
pub fn plan_transition(current: Option<Mode>, target: Mode) -> TransitionPlan {
    if target == Mode::Off {
        return TransitionPlan::Direct;
    }

    let Some(current) = current else {
        return TransitionPlan::OffFirst;
    };

    if current == target {
        return TransitionPlan::Direct;
    }

    let crossing = matches!(
        (ModeFamily::of(current), ModeFamily::of(target)),
        (ModeFamily::Heat, ModeFamily::Cool)
            | (ModeFamily::Cool, ModeFamily::Heat)
            | (ModeFamily::Dry, _)
            | (_, ModeFamily::Dry)
    );

    if crossing {
        TransitionPlan::OffFirst
    } else {
        TransitionPlan::Direct
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use Mode::*;
    use TransitionPlan::*;

    #[test]
    fn crossing_matrix_matches_family_table() {
        let cases = [
            // current = OFF
            (Off, Off, Direct),
            (Off, Heat, Direct),
            (Off, Turbo, Direct),
            (Off, Dry, OffFirst),
            (Off, Cool, Direct),
            (Off, ExtHeat, Direct),
            // current = HEAT
            (Heat, Off, Direct),
            (Heat, Heat, Direct),
            (Heat, Turbo, Direct),
            (Heat, Dry, OffFirst),
            (Heat, Cool, OffFirst),
            (Heat, ExtHeat, Direct),
            // current = TURBO
            (Turbo, Off, Direct),
            (Turbo, Heat, Direct),
            (Turbo, Turbo, Direct),
            (Turbo, Dry, OffFirst),
            (Turbo, Cool, OffFirst),
            (Turbo, ExtHeat, Direct),
            // current = DRY
            (Dry, Off, Direct),
            (Dry, Heat, OffFirst),
            (Dry, Turbo, OffFirst),
            (Dry, Dry, Direct),
            (Dry, Cool, OffFirst),
            (Dry, ExtHeat, OffFirst),
            // current = COOL
            (Cool, Off, Direct),
            (Cool, Heat, OffFirst),
            (Cool, Turbo, OffFirst),
            (Cool, Dry, OffFirst),
            (Cool, Cool, Direct),
            (Cool, ExtHeat, OffFirst),
            // current = EXT-HEAT
            (ExtHeat, Off, Direct),
            (ExtHeat, Heat, Direct),
            (ExtHeat, Turbo, Direct),
            (ExtHeat, Dry, OffFirst),
            (ExtHeat, Cool, OffFirst),
            (ExtHeat, ExtHeat, Direct),
        ];
        assert_eq!(cases.len(), 36);

        for (current, target, expected) in cases {
            assert_eq!(
                plan_transition(Some(current), target),
                expected,
                "{current} -> {target}"
            );
        }
    }

    #[test]
    fn unknown_current_mode_goes_through_off() {
        for target in Mode::ALL {
            let expected = if target == Off { Direct } else { OffFirst };
            assert_eq!(plan_transition(None, target), expected, "? -> {target}");
        }
    }

    #[test]
    fn families() {
        assert_eq!(ModeFamily::of(ExtHeat), ModeFamily::Heat);
        assert_eq!(ModeFamily::of(Turbo), ModeFamily::Heat);
        assert_eq!(ModeFamily::of(Dry), ModeFamily::Dry);
    }
}
