use clap::ValueEnum;
use lore_analysis::Tier;

#[derive(Copy, Clone, ValueEnum)]
pub(crate) enum TierFlag {
    Quick,
    Detailed,
    Deep,
    Full,
}

impl TierFlag {
    pub(crate) const fn as_domain(self) -> Tier {
        match self {
            TierFlag::Quick => Tier::Quick,
            TierFlag::Detailed => Tier::Detailed,
            TierFlag::Deep => Tier::Deep,
            TierFlag::Full => Tier::Full,
        }
    }
}
